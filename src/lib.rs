//! Slow-query observation, analysis and feedback loop.
//!
//! This library contains the core modules: collection from monitored
//! databases' native slow-query surfaces, rule-based and oracle-assisted
//! analysis, feedback-driven effectiveness learning, the scheduler that
//! drives all three at independent cadences, and the read-only dashboard
//! API that exposes the results.

pub mod analyzer;
pub mod collector;
pub mod config;
pub mod fingerprint;
pub mod http;
pub mod learning;
pub mod models;
pub mod probes;
pub mod scheduler;
pub mod store;
pub mod utils;

use std::sync::Arc;

use analyzer::oracle::OracleClient;
use analyzer::Analyzer;
use collector::Collector;
use config::Config;
use learning::LearningEvaluator;
use scheduler::Scheduler;
use store::Store;

/// Shared state handed to the HTTP router. The dashboard API only ever
/// reads through the Store; the background pipelines are owned separately
/// by the Scheduler once the process is wired up in `main`.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

/// Builds the Store, the three background pipelines and the Scheduler from
/// a loaded `Config`, applying the one-time registry seed. Split out of
/// `main` so integration tests can assemble the same pipeline wiring
/// against an in-memory store.
pub async fn build(config: &Config) -> AppResultBuild {
    let store = Store::connect(
        &config.store.url,
        config.store.pool_size,
        config.scheduler.claim_timeout_secs,
        config.learning.feedback_idempotency_secs,
    )
    .await?;

    store.seed_if_empty(&config.seed_databases).await?;

    let collector = Collector::new(store.clone(), config.probe.clone());
    let oracle = OracleClient::new(config.oracle.clone());
    let analyzer = Analyzer::new(store.clone(), config.oracle.schema_cache_size, oracle, config.analyzer.clone());
    let learning = LearningEvaluator::new(store.clone(), config.learning.clone());

    let scheduler = Scheduler::new(store.clone(), collector, analyzer, learning, config.scheduler.clone());
    let state = Arc::new(AppState { store });

    Ok((state, scheduler))
}

pub type AppResultBuild = Result<(Arc<AppState>, Scheduler), utils::AppError>;
