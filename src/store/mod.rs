//! Internal Store (§4.2): the sole mutable shared resource. Every
//! cross-component state transition — observation status, analysis
//! finalisation, feedback insertion — happens inside a single transaction
//! here. Grounded on this codebase's `db::create_pool` (sqlite pool + WAL
//! pragmas) and the transactional write patterns used throughout its
//! service layer (`pool.begin()` / `tx.commit()`).

pub mod analysis;
pub mod dashboard;
pub mod feedback;
pub mod observation;
pub mod probe_registry;

use chrono::Duration as ChronoDuration;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::utils::error::AppResult;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    claim_timeout: ChronoDuration,
    feedback_idempotency: ChronoDuration,
}

impl Store {
    pub async fn connect(
        url: &str,
        pool_size: u32,
        claim_timeout_secs: u64,
        feedback_idempotency_secs: u64,
    ) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            sqlx::Error::Configuration(format!("migration failed: {e}").into())
        })?;

        Ok(Self {
            pool,
            claim_timeout: ChronoDuration::seconds(claim_timeout_secs as i64),
            feedback_idempotency: ChronoDuration::seconds(feedback_idempotency_secs as i64),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    Store::connect("sqlite::memory:", 5, 300, 24 * 3600).await.unwrap()
}
