//! Shared domain types for the four entities the Internal Store owns:
//! Observation, Analysis, FeedbackEntry, MonitoredDatabase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// SQLite has no native enum column type, so each of these is stored as TEXT
// and converted at the store boundary via `as_str`/`parse` rather than a
// derived `sqlx::Type` (which only maps cleanly onto Postgres catalog enums).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Mysql,
    Postgres,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Mysql => "mysql",
            SourceType::Postgres => "postgres",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "mysql" => Ok(SourceType::Mysql),
            "postgres" => Ok(SourceType::Postgres),
            other => Err(format!("unknown source_type: {other}")),
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// §3: NEW -> IN_FLIGHT -> ANALYZED, or NEW/IN_FLIGHT -> ERROR. ANALYZED and
/// ERROR are both terminal and never re-entered once left (P3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObservationStatus {
    New,
    InFlight,
    Analyzed,
    Error,
}

impl ObservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationStatus::New => "NEW",
            ObservationStatus::InFlight => "IN_FLIGHT",
            ObservationStatus::Analyzed => "ANALYZED",
            ObservationStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "NEW" => Ok(ObservationStatus::New),
            "IN_FLIGHT" => Ok(ObservationStatus::InFlight),
            "ANALYZED" => Ok(ObservationStatus::Analyzed),
            "ERROR" => Ok(ObservationStatus::Error),
            other => Err(format!("unknown observation status: {other}")),
        }
    }
}

impl std::fmt::Display for ObservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Effectiveness {
    Pending,
    Confirmed,
    Failed,
}

impl Effectiveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effectiveness::Pending => "PENDING",
            Effectiveness::Confirmed => "CONFIRMED",
            Effectiveness::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "PENDING" => Ok(Effectiveness::Pending),
            "CONFIRMED" => Ok(Effectiveness::Confirmed),
            "FAILED" => Ok(Effectiveness::Failed),
            other => Err(format!("unknown effectiveness: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImprovementLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ImprovementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImprovementLevel::Low => "LOW",
            ImprovementLevel::Medium => "MEDIUM",
            ImprovementLevel::High => "HIGH",
            ImprovementLevel::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "LOW" => Ok(ImprovementLevel::Low),
            "MEDIUM" => Ok(ImprovementLevel::Medium),
            "HIGH" => Ok(ImprovementLevel::High),
            "CRITICAL" => Ok(ImprovementLevel::Critical),
            other => Err(format!("unknown improvement level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Disabled,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Degraded => "DEGRADED",
            HealthState::Disabled => "DISABLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "HEALTHY" => Ok(HealthState::Healthy),
            "DEGRADED" => Ok(HealthState::Degraded),
            "DISABLED" => Ok(HealthState::Disabled),
            other => Err(format!("unknown health state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Observation {
    pub id: i64,
    pub source_type: SourceType,
    pub source_host: String,
    pub source_database: String,
    pub fingerprint: String,
    pub full_sql: String,
    pub duration_ms: f64,
    pub rows_examined: Option<i64>,
    pub rows_returned: Option<i64>,
    pub captured_at: DateTime<Utc>,
    pub plan: Option<String>,
    pub status: ObservationStatus,
    pub tenant_scope: String,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Input to `Store::insert_observation` — everything about a captured slow
/// execution except the identity and lifecycle fields the Store owns.
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub source_type: SourceType,
    pub source_host: String,
    pub source_database: String,
    pub fingerprint: String,
    pub full_sql: String,
    pub duration_ms: f64,
    pub rows_examined: Option<i64>,
    pub rows_returned: Option<i64>,
    pub captured_at: DateTime<Utc>,
    pub plan: Option<String>,
    pub tenant_scope: String,
}

/// One recommendation item inside an Analysis. Modeled as a tagged record with
/// optional fields rather than a free-form dictionary, per §9's note on
/// heterogeneous recommendation shapes, stored as a JSON column.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Recommendation {
    pub kind: String,
    pub priority: u8,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_impact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Analysis {
    pub id: i64,
    pub observation_id: i64,
    pub problem: String,
    pub root_cause: String,
    pub recommendations: Vec<Recommendation>,
    pub improvement_level: ImprovementLevel,
    pub effectiveness: Effectiveness,
    pub gain_ratio: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub provider: String,
    pub model_version: String,
}

/// Input to `Store::finalize_analysis` — an Analysis is always born PENDING
/// with a NULL gain_ratio (§3), so neither field is accepted here.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub problem: String,
    pub root_cause: String,
    pub recommendations: Vec<Recommendation>,
    pub improvement_level: ImprovementLevel,
    pub provider: String,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FeedbackEntry {
    pub id: i64,
    pub fingerprint: String,
    pub analysis_id: i64,
    pub old_duration_ms: f64,
    pub new_duration_ms: f64,
    pub gain_ratio: f64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFeedbackEntry {
    pub fingerprint: String,
    pub analysis_id: i64,
    pub old_duration_ms: f64,
    pub new_duration_ms: f64,
    pub gain_ratio: f64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MonitoredDatabase {
    pub id: i64,
    pub dialect: SourceType,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub monitor_username: String,
    pub tenant_scope: String,
    pub enabled: bool,
    pub last_cursor: Option<String>,
    pub health_state: HealthState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `Store::upsert_monitored_database` — the operator-/collaborator-
/// supplied half of a registry row; the core fills in timestamps and initial
/// health state.
#[derive(Debug, Clone)]
pub struct MonitoredDatabaseUpsert {
    pub id: Option<i64>,
    pub dialect: SourceType,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub monitor_username: String,
    pub monitor_password: String,
    pub tenant_scope: String,
    pub enabled: bool,
}

/// Summary row backing `GET /slow-queries` (§6).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FingerprintSummary {
    pub fingerprint: String,
    pub sample_sql: String,
    pub avg_duration_ms: f64,
    pub observation_count: i64,
    pub best_effectiveness: Option<Effectiveness>,
    pub max_confirmed_gain: Option<f64>,
    pub last_seen: DateTime<Utc>,
}

/// Row backing `top_recommendations` (§4.2, §4.6): CONFIRMED recommendations
/// grouped by rule kind, ordered by mean gain.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TopRecommendation {
    pub kind: String,
    pub sample_description: String,
    pub mean_gain_ratio: f64,
    pub confirmed_count: i64,
}

/// Aggregate counters backing `GET /stats/dashboard` (§6).
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DashboardStats {
    pub total_observations: i64,
    pub total_analyses: i64,
    pub pending_count: i64,
    pub confirmed_count: i64,
    pub failed_count: i64,
    /// One bucket per day over the trailing 7 days, oldest first.
    pub confirmed_gain_histogram_7d: Vec<GainBucket>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GainBucket {
    pub day: chrono::NaiveDate,
    pub confirmed_count: i64,
    pub mean_gain_ratio: f64,
}
