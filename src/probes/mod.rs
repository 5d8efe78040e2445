//! Upstream Probe (§4.3): one instance per registered `MonitoredDatabase`,
//! each knowing its dialect and exposing `fetch_since(cursor)`. Grounded on
//! this codebase's per-cluster `MySQLPoolManager` (one pooled connection per
//! monitored cluster, keyed by cluster id) — here generalised to one pooled
//! probe handle per monitored database row, dialect-dispatched.

pub mod mysql;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::NewObservation;

/// Opaque, monotonic cursor. Probes must never re-emit an observation with a
/// `captured_at` at or before the prior cursor, except for a small replay
/// overlap tolerated for clock skew (§4.3) — the Store's dedup absorbs the
/// resulting duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn epoch() -> Self {
        Cursor(DateTime::<Utc>::from_timestamp(0, 0).unwrap().to_rfc3339())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("required schema object missing: {0}")]
    SchemaMissing(String),

    #[error("probe call exceeded its deadline")]
    Deadline,

    #[error("query failed: {0}")]
    Query(String),
}

impl ProbeError {
    /// (a) connection hiccups and generic query failures are worth retrying;
    /// (b) auth failures and missing schema objects are permanent — the
    /// Collector moves the probe to DISABLED rather than retrying (§4.4, §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProbeError::Connection(_) | ProbeError::Query(_) | ProbeError::Deadline)
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ProbeError::Auth(_) | ProbeError::SchemaMissing(_))
    }
}

/// Dialect-specific adapter over a monitored database's slow-log surface.
#[async_trait]
pub trait UpstreamProbe: Send + Sync {
    /// Returns observations with `captured_at` after `cursor`, plus the new
    /// cursor to persist on successful commit. Implementations sanitise
    /// emitted SQL (trailing semicolons, BOM) and never block past the
    /// configured deadline (§4.3).
    async fn fetch_since(&self, cursor: &Cursor) -> Result<(Vec<NewObservation>, Cursor), ProbeError>;

    fn dialect_name(&self) -> &'static str;
}

/// Strips a trailing semicolon and a leading UTF-8 BOM, and returns a SQL
/// string trimmed of surrounding whitespace (§4.3c).
pub fn sanitize_sql(raw: &str) -> String {
    let without_bom = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let trimmed = without_bom.trim();
    trimmed.strip_suffix(';').unwrap_or(trimmed).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_bom_and_trailing_semicolon() {
        let raw = "\u{feff}select 1 from t;  ";
        assert_eq!(sanitize_sql(raw), "select 1 from t");
    }
}
