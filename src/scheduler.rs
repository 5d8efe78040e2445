//! Scheduler (§4.7): drives the Collector, Analyzer and Learning Evaluator
//! at independent cadences, each job behind a single-holder lease so an
//! overlapping tick is skipped rather than queued. The tick-loop shape
//! (compute next execution, sleep to it, check a shutdown flag each pass)
//! is grounded on the teacher's hand-rolled scheduled-task executor;
//! extended here into one state machine per job plus a shutdown grace
//! period, since the teacher's executor has no notion of overlap-skip
//! counting or coordinated shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::analyzer::Analyzer;
use crate::collector::Collector;
use crate::config::SchedulerConfig;
use crate::learning::LearningEvaluator;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Cancelling,
    Failed,
}

struct Job {
    name: &'static str,
    interval: Duration,
    state: Arc<std::sync::Mutex<JobState>>,
    skipped_ticks: Arc<AtomicU64>,
}

impl Job {
    fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            state: Arc::new(std::sync::Mutex::new(JobState::Idle)),
            skipped_ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    fn try_start(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == JobState::Running {
            self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job = self.name, "tick skipped: previous run still in flight");
            return false;
        }
        *state = JobState::Running;
        true
    }

    fn finish(&self, outcome: Result<(), ()>) {
        let mut state = self.state.lock().unwrap();
        *state = match (*state, outcome) {
            (JobState::Cancelling, _) => JobState::Idle,
            (_, Ok(())) => JobState::Idle,
            (_, Err(())) => JobState::Failed,
        };
    }

    fn mark_cancelling(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == JobState::Running {
            *state = JobState::Cancelling;
        }
    }
}

/// Owns the three background jobs and their shutdown coordination. Built
/// once at startup and driven for the process lifetime (§9e: "global
/// scheduler state becomes an explicit Scheduler object").
pub struct Scheduler {
    store: Store,
    collector: Arc<Collector>,
    analyzer: Arc<Analyzer>,
    learning: Arc<LearningEvaluator>,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        collector: Collector,
        analyzer: Analyzer,
        learning: LearningEvaluator,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            collector: Arc::new(collector),
            analyzer: Arc::new(analyzer),
            learning: Arc::new(learning),
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawns the three job loops and blocks until every one of them has
    /// observed shutdown and exited (or the grace period elapses, in which
    /// case in-flight claims are force-released). Takes `&self` rather than
    /// consuming the Scheduler so a caller can hold it in an `Arc` and call
    /// `shutdown` from another task once `run` is under way.
    pub async fn run(&self) {
        let collect_job = Job::new("collector", Duration::from_secs(self.config.collect_interval_secs));
        let analyze_job = Job::new("analyzer", Duration::from_secs(self.config.analyze_interval_secs));
        let learn_job = Job::new("learning", Duration::from_secs(self.config.learn_interval_secs));

        let collector = self.collector.clone();
        let analyzer = self.analyzer.clone();
        let learning = self.learning.clone();

        let rx1 = self.shutdown_rx.clone();
        let rx2 = self.shutdown_rx.clone();
        let rx3 = self.shutdown_rx.clone();

        let collect_handle = tokio::spawn(tick_loop(collect_job, rx1, move || {
            let collector = collector.clone();
            async move { collector.run_once().await.map(|_| ()).map_err(|e| e.to_string()) }
        }));

        let analyze_handle = tokio::spawn(tick_loop(analyze_job, rx2, move || {
            let analyzer = analyzer.clone();
            async move { analyzer.run_once().await.map(|_| ()).map_err(|e| e.to_string()) }
        }));

        let learn_handle = tokio::spawn(tick_loop(learn_job, rx3, move || {
            let learning = learning.clone();
            async move { learning.run_once(50).await.map(|_| ()).map_err(|e| e.to_string()) }
        }));

        let _ = tokio::join!(collect_handle, analyze_handle, learn_handle);
    }

    /// Signals all jobs to stop, waits up to `shutdown_grace_secs` for
    /// in-flight ticks to finish, then force-releases any claims still
    /// outstanding (§4.7, §5).
    pub async fn shutdown(&self) {
        tracing::info!("scheduler shutdown requested");
        let _ = self.shutdown_tx.send(true);

        tokio::time::sleep(Duration::from_secs(self.config.shutdown_grace_secs)).await;

        match self.store.release_all_claims().await {
            Ok(count) if count > 0 => {
                tracing::warn!(count, "force-released in-flight claims past shutdown grace period")
            },
            Ok(_) => {},
            Err(e) => tracing::error!(error = %e, "failed to release claims on shutdown"),
        }
    }
}

async fn tick_loop<F, Fut>(job: Job, mut shutdown_rx: watch::Receiver<bool>, make_fut: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut next_tick = Instant::now() + job.interval;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    job.mark_cancelling();
                    tracing::info!(job = job.name, "job observed shutdown signal");
                    break;
                }
            }
            _ = tokio::time::sleep_until(next_tick) => {
                next_tick = Instant::now() + job.interval;

                if *shutdown_rx.borrow() {
                    break;
                }
                if !job.try_start() {
                    continue;
                }

                let outcome = make_fut().await;
                match &outcome {
                    Ok(()) => {},
                    Err(e) => tracing::error!(job = job.name, error = %e, "job tick failed"),
                }
                job.finish(outcome.map_err(|_| ()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_skips_overlapping_tick() {
        let job = Job::new("test", Duration::from_secs(1));
        assert!(job.try_start());
        assert!(!job.try_start());
        assert_eq!(job.skipped_ticks.load(Ordering::Relaxed), 1);
        job.finish(Ok(()));
        assert!(job.try_start());
    }

    #[test]
    fn cancelling_job_returns_to_idle_on_finish() {
        let job = Job::new("test", Duration::from_secs(1));
        job.try_start();
        job.mark_cancelling();
        job.finish(Ok(()));
        assert_eq!(*job.state.lock().unwrap(), JobState::Idle);
    }
}
