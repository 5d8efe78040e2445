//! PostgreSQL dialect probe (§4.3): reads `pg_stat_statements`, which only
//! retains running aggregates (no per-call timestamps), so each tick emits
//! one observation per statement whose call count advanced since the last
//! poll, timestamped `now()`. Grounded on the pgorm example repo's
//! tokio-postgres + deadpool-postgres pooling pattern — the closest fit in
//! this codebase's retrieval pack for a pooled Postgres reader, since this
//! teacher's own stack only speaks MySQL.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::collections::HashMap;
use tokio_postgres::NoTls;

use super::{sanitize_sql, Cursor, ProbeError, UpstreamProbe};
use crate::models::{NewObservation, SourceType};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
struct QueryDelta {
    calls: i64,
    total_exec_time_ms: f64,
}

pub struct PostgresProbe {
    pool: Pool,
    source_host: String,
    source_database: String,
    tenant_scope: String,
    batch_limit: i64,
}

impl PostgresProbe {
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        monitor_username: &str,
        monitor_password: &str,
        tenant_scope: &str,
    ) -> Result<Self, ProbeError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(host)
            .port(port)
            .dbname(database)
            .user(monitor_username)
            .password(monitor_password);

        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );
        let pool = Pool::builder(manager)
            .max_size(4)
            .build()
            .map_err(|e| ProbeError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            source_host: format!("{host}:{port}"),
            source_database: database.to_string(),
            tenant_scope: tenant_scope.to_string(),
            batch_limit: 500,
        })
    }
}

#[async_trait]
impl UpstreamProbe for PostgresProbe {
    async fn fetch_since(&self, cursor: &Cursor) -> Result<(Vec<NewObservation>, Cursor), ProbeError> {
        let mut last_seen: HashMap<String, QueryDelta> = if cursor.0.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&cursor.0).unwrap_or_default()
        };

        let client = self.pool.get().await.map_err(|e| ProbeError::Connection(e.to_string()))?;

        let rows = client
            .query(
                r#"SELECT queryid::text AS queryid, query, calls, total_exec_time
                   FROM pg_stat_statements
                   ORDER BY queryid
                   LIMIT $1"#,
                &[&self.batch_limit],
            )
            .await
            .map_err(|e| classify_query_error(&e))?;

        let mut observations = Vec::new();
        let now = Utc::now();

        for row in &rows {
            let queryid: String = row.get("queryid");
            let query_text: String = row.get("query");
            let calls: i64 = row.get("calls");
            let total_exec_time: f64 = row.get("total_exec_time");

            let prior = last_seen.get(&queryid).cloned().unwrap_or_default();
            let delta_calls = calls - prior.calls;
            if delta_calls <= 0 {
                last_seen.insert(queryid, QueryDelta { calls, total_exec_time_ms: total_exec_time });
                continue;
            }

            let delta_time = (total_exec_time - prior.total_exec_time_ms).max(0.0);
            let avg_duration_ms = delta_time / delta_calls as f64;

            observations.push(NewObservation {
                source_type: SourceType::Postgres,
                source_host: self.source_host.clone(),
                source_database: self.source_database.clone(),
                fingerprint: crate::fingerprint::fingerprint(&query_text),
                full_sql: sanitize_sql(&query_text),
                duration_ms: avg_duration_ms,
                rows_examined: None,
                rows_returned: None,
                captured_at: now,
                plan: None,
                tenant_scope: self.tenant_scope.clone(),
            });

            last_seen.insert(queryid, QueryDelta { calls, total_exec_time_ms: total_exec_time });
        }

        let new_cursor = serde_json::to_string(&last_seen).unwrap_or_else(|_| cursor.0.clone());
        Ok((observations, Cursor(new_cursor)))
    }

    fn dialect_name(&self) -> &'static str {
        "postgres"
    }
}

fn classify_query_error(e: &tokio_postgres::Error) -> ProbeError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("authentication") {
        ProbeError::Auth(msg)
    } else if lower.contains("does not exist") || lower.contains("extension") {
        ProbeError::SchemaMissing(msg)
    } else {
        ProbeError::Query(msg)
    }
}
