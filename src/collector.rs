//! Collector (§4.4): fans a poll tick out across every registered probe with
//! bounded concurrency, advances each probe's cursor only after its batch
//! commits, and tracks per-probe health so a persistently failing probe
//! degrades instead of spinning forever. Concurrency and per-item isolation
//! are grounded on the same `Semaphore`-bounded fan-out this codebase's
//! `MetricsCollectorService` runs per cluster on each collection tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};

use crate::config::ProbeConfig;
use crate::models::HealthState;
use crate::probes::mysql::MysqlProbe;
use crate::probes::postgres::PostgresProbe;
use crate::probes::{Cursor, ProbeError, UpstreamProbe};
use crate::store::Store;
use crate::utils::AppResult;

pub struct Collector {
    store: Store,
    config: ProbeConfig,
    /// Probe ids currently mid-poll, so an overlapping scheduler tick drops
    /// a still-running probe instead of queuing a second concurrent poll
    /// against it (§4.4: "a probe never runs two polls concurrently").
    in_flight: Arc<Mutex<HashSet<i64>>>,
    /// Consecutive transient-failure counts per probe id, reset on any
    /// successful poll (§4.4, §7: DEGRADED after N consecutive failures).
    failure_counts: Arc<Mutex<HashMap<i64, u32>>>,
}

struct ProbeHandle {
    id: i64,
    host: String,
    upstream: Box<dyn UpstreamProbe>,
    cursor: Cursor,
}

impl Collector {
    pub fn new(store: Store, config: ProbeConfig) -> Self {
        Self {
            store,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            failure_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs one collection tick: builds a probe handle per enabled,
    /// non-disabled registry row, then polls each with bounded concurrency.
    /// Returns the total number of observations inserted (deduped rows
    /// still advance the cursor but don't count here).
    pub async fn run_once(&self) -> AppResult<usize> {
        let connections = self.store.list_probe_connections(true).await?;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::new();

        for conn in connections {
            if conn.database.health_state == HealthState::Disabled {
                continue;
            }
            let upstream: Box<dyn UpstreamProbe> = match build_probe(&conn, &self.config) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(probe_id = conn.database.id, error = %e, "failed to construct probe");
                    continue;
                },
            };
            let cursor = conn
                .database
                .last_cursor
                .clone()
                .map(Cursor)
                .unwrap_or_else(Cursor::epoch);

            let probe = ProbeHandle { id: conn.database.id, host: conn.database.host.clone(), upstream, cursor };

            let already_running = {
                let mut guard = self.in_flight.lock().await;
                if guard.contains(&probe.id) {
                    true
                } else {
                    guard.insert(probe.id);
                    false
                }
            };
            if already_running {
                tracing::debug!(probe_id = probe.id, "skipping tick: prior poll still in flight");
                continue;
            }

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let store = self.store.clone();
            let deadline = Duration::from_secs(self.config.deadline_secs);
            let max_failures = self.config.max_consecutive_failures_before_degraded;
            let in_flight = self.in_flight.clone();
            let failure_counts = self.failure_counts.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = poll_one(&store, &probe, deadline, max_failures, &failure_counts).await;
                in_flight.lock().await.remove(&probe.id);
                result
            }));
        }

        let mut inserted_total = 0;
        for handle in handles {
            match handle.await {
                Ok(Ok(inserted)) => inserted_total += inserted,
                Ok(Err(e)) => tracing::warn!(error = %e, "probe poll failed"),
                Err(join_err) => tracing::error!(error = %join_err, "collector worker task panicked"),
            }
        }

        Ok(inserted_total)
    }
}

async fn poll_one(
    store: &Store,
    probe: &ProbeHandle,
    deadline: Duration,
    max_failures: u32,
    failure_counts: &Mutex<HashMap<i64, u32>>,
) -> AppResult<usize> {
    let fetch = tokio::time::timeout(deadline, probe.upstream.fetch_since(&probe.cursor)).await;

    let (observations, new_cursor) = match fetch {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            handle_probe_error(store, probe, &e, max_failures, failure_counts).await;
            return Ok(0);
        },
        Err(_elapsed) => {
            handle_probe_error(store, probe, &ProbeError::Deadline, max_failures, failure_counts).await;
            return Ok(0);
        },
    };

    let mut inserted = 0;
    for obs in observations {
        match store.insert_observation(obs).await {
            Ok((_, true)) => inserted += 1,
            Ok((_, false)) => {},
            Err(e) => tracing::warn!(probe_id = probe.id, host = %probe.host, error = %e, "failed to persist observation"),
        }
    }

    // Cursor advances even when every row deduped, since the poll itself
    // succeeded and re-fetching the same window forever would be wasted
    // work (§4.4: cursor advances on successful batch commit).
    store.update_probe_cursor(probe.id, &new_cursor.0).await?;
    failure_counts.lock().await.remove(&probe.id);
    store.record_probe_health(probe.id, HealthState::Healthy, None).await?;

    Ok(inserted)
}

async fn handle_probe_error(
    store: &Store,
    probe: &ProbeHandle,
    error: &ProbeError,
    max_failures: u32,
    failure_counts: &Mutex<HashMap<i64, u32>>,
) {
    tracing::warn!(probe_id = probe.id, host = %probe.host, error = %error, "probe poll error");

    // A permanent error (bad credentials, missing slow-log table) disables
    // the probe outright regardless of the failure count; a transient one
    // only degrades the probe after `max_failures` consecutive misses
    // (§4.4, §7).
    let target_state = if error.is_permanent() {
        Some(HealthState::Disabled)
    } else {
        let mut counts = failure_counts.lock().await;
        let count = counts.entry(probe.id).or_insert(0);
        *count += 1;
        if *count >= max_failures.max(1) {
            Some(HealthState::Degraded)
        } else {
            None
        }
    };

    if let Some(state) = target_state {
        if let Err(e) = store.record_probe_health(probe.id, state, Some(&error.to_string())).await {
            tracing::error!(probe_id = probe.id, error = %e, "failed to record probe health");
        }
    }
}

fn build_probe(
    conn: &crate::store::probe_registry::ProbeConnection,
    config: &ProbeConfig,
) -> Result<Box<dyn UpstreamProbe>, ProbeError> {
    use crate::models::SourceType;

    match conn.database.dialect {
        SourceType::Mysql => Ok(Box::new(MysqlProbe::new(
            &conn.database.host,
            conn.database.port,
            &conn.database.database_name,
            &conn.database.monitor_username,
            &conn.monitor_password,
            &conn.database.tenant_scope,
            chrono::Duration::seconds(config.replay_overlap_secs),
        ))),
        SourceType::Postgres => Ok(Box::new(PostgresProbe::new(
            &conn.database.host,
            conn.database.port,
            &conn.database.database_name,
            &conn.database.monitor_username,
            &conn.monitor_password,
            &conn.database.tenant_scope,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_once_on_empty_registry_returns_zero() {
        let store = crate::store::test_store().await;
        let collector = Collector::new(store, ProbeConfig::default());
        let inserted = collector.run_once().await.unwrap();
        assert_eq!(inserted, 0);
    }
}
