//! MySQL dialect probe (§4.3): reads `mysql.slow_log` (log_output=TABLE).
//! Grounded on this codebase's `mysql_client`/`mysql_pool_manager` pooled
//! connection pattern, narrowed to a single read-only query against the
//! slow-log surface instead of general cluster administration.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use mysql_async::prelude::*;
use mysql_async::{OptsBuilder, Pool};

use super::{sanitize_sql, Cursor, ProbeError, UpstreamProbe};
use crate::models::{NewObservation, SourceType};

pub struct MysqlProbe {
    pool: Pool,
    source_host: String,
    source_database: String,
    monitor_username: String,
    tenant_scope: String,
    replay_overlap: chrono::Duration,
    batch_limit: u32,
}

impl MysqlProbe {
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        monitor_username: &str,
        monitor_password: &str,
        tenant_scope: &str,
        replay_overlap: chrono::Duration,
    ) -> Self {
        let opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .db_name(Some(database))
            .user(Some(monitor_username))
            .pass(Some(monitor_password));
        Self {
            pool: Pool::new(opts),
            source_host: format!("{host}:{port}"),
            source_database: database.to_string(),
            monitor_username: monitor_username.to_string(),
            tenant_scope: tenant_scope.to_string(),
            replay_overlap,
            batch_limit: 500,
        }
    }

    fn parse_cursor(&self, cursor: &Cursor) -> NaiveDateTime {
        chrono::DateTime::parse_from_rfc3339(&cursor.0)
            .map(|d| d.naive_utc())
            .unwrap_or_else(|_| Utc::now().naive_utc() - chrono::Duration::days(1))
    }
}

#[async_trait]
impl UpstreamProbe for MysqlProbe {
    async fn fetch_since(&self, cursor: &Cursor) -> Result<(Vec<NewObservation>, Cursor), ProbeError> {
        let since = self.parse_cursor(cursor) - self.replay_overlap;

        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| classify_connection_error(&e))?;

        let rows: Vec<(String, String, f64, Option<i64>, Option<i64>, String, String)> = conn
            .exec(
                r#"SELECT
                    CAST(start_time AS CHAR) AS start_time_str,
                    user_host,
                    TIME_TO_SEC(query_time) + MICROSECOND(query_time) / 1000000.0 AS query_time_secs,
                    rows_sent, rows_examined, db, sql_text
                   FROM mysql.slow_log
                   WHERE start_time > ? AND user_host NOT LIKE CONCAT(?, '@%')
                   ORDER BY start_time ASC
                   LIMIT ?"#,
                (since.format("%Y-%m-%d %H:%M:%S%.f").to_string(), self.monitor_username.clone(), self.batch_limit),
            )
            .await
            .map_err(|e| ProbeError::Query(e.to_string()))?;

        let mut observations = Vec::with_capacity(rows.len());
        let mut max_captured_at = None;

        for (start_time_str, _user_host, query_time_secs, rows_sent, rows_examined, db, sql_text) in rows {
            let Ok(naive) = NaiveDateTime::parse_from_str(&start_time_str, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(&start_time_str, "%Y-%m-%d %H:%M:%S"))
            else {
                tracing::debug!(start_time_str, "skipping slow_log row with unparseable start_time");
                continue;
            };
            let captured_at = Utc.from_utc_datetime(&naive);
            max_captured_at = Some(max_captured_at.map_or(captured_at, |m: chrono::DateTime<Utc>| m.max(captured_at)));

            let source_database = if db.is_empty() { self.source_database.clone() } else { db };
            observations.push(NewObservation {
                source_type: SourceType::Mysql,
                source_host: self.source_host.clone(),
                source_database,
                fingerprint: crate::fingerprint::fingerprint(&sql_text),
                full_sql: sanitize_sql(&sql_text),
                duration_ms: query_time_secs * 1000.0,
                rows_examined,
                rows_returned: rows_sent,
                captured_at,
                plan: None,
                tenant_scope: self.tenant_scope.clone(),
            });
        }

        let new_cursor = max_captured_at.map(|c| Cursor(c.to_rfc3339())).unwrap_or_else(|| cursor.clone());
        Ok((observations, new_cursor))
    }

    fn dialect_name(&self) -> &'static str {
        "mysql"
    }
}

fn classify_connection_error(e: &mysql_async::Error) -> ProbeError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("access denied") || lower.contains("authentication") {
        ProbeError::Auth(msg)
    } else if lower.contains("unknown table") || lower.contains("doesn't exist") {
        ProbeError::SchemaMissing(msg)
    } else {
        ProbeError::Connection(msg)
    }
}
