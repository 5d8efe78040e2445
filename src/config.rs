use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub learning: LearningConfig,
    pub analyzer: AnalyzerConfig,
    pub probe: ProbeConfig,
    pub oracle: OracleConfig,
    /// Seed list read at first boot if the `monitored_databases` table is empty
    /// (§9c) so the core is runnable standalone without the registration
    /// collaborator.
    pub seed_databases: Vec<SeedDatabase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/queryloop.db".to_string(), pool_size: 20 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,queryloop_core=debug".to_string(), file: Some("logs/queryloop.log".to_string()) }
    }
}

/// Cadence and lease configuration for the three background pipelines (§4.7).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub collect_interval_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub analyze_interval_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub learn_interval_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub claim_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            collect_interval_secs: 60,
            analyze_interval_secs: 300,
            learn_interval_secs: 1800,
            shutdown_grace_secs: 30,
            claim_timeout_secs: 300,
        }
    }
}

/// Learning Evaluator tunables (§4.6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub improvement_threshold: f64,
    pub min_samples: u32,
    pub sample_size: u32,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub grace_secs: u64,
    #[serde(deserialize_with = "deserialize_days_i64")]
    pub max_pending_age_days: i64,
    pub min_baseline_ms: f64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub pending_min_age_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub feedback_idempotency_secs: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            improvement_threshold: 0.30,
            min_samples: 3,
            sample_size: 5,
            grace_secs: 10 * 60,
            max_pending_age_days: 30,
            min_baseline_ms: 10.0,
            pending_min_age_secs: 10 * 60,
            feedback_idempotency_secs: 24 * 60 * 60,
        }
    }
}

/// Analyzer tunables (§4.5).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub batch_size: u32,
    pub concurrency: usize,
    pub oracle_max_retries: u32,
    pub min_recommendations: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self { batch_size: 50, concurrency: 4, oracle_max_retries: 3, min_recommendations: 3 }
    }
}

/// Upstream probe tunables (§4.3, §5).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub deadline_secs: u64,
    pub concurrency: usize,
    pub replay_overlap_secs: i64,
    pub max_consecutive_failures_before_degraded: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 30,
            concurrency: 16,
            replay_overlap_secs: 30,
            max_consecutive_failures_before_degraded: 3,
        }
    }
}

/// The oracle collaborator's calling convention (§9b) — endpoint, model,
/// response-cache sizing. The provider call itself stays out of scope; this is
/// only how we talk to whatever is behind `oracle.base_url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub timeout_secs: u64,
    pub response_cache_size: usize,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub response_cache_ttl_secs: u64,
    pub schema_cache_size: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            response_cache_size: 1024,
            response_cache_ttl_secs: 6 * 60 * 60,
            schema_cache_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedDatabase {
    pub dialect: String,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub monitor_username: String,
    pub monitor_password: String,
    #[serde(default)]
    pub tenant_scope: String,
}

/// Command line arguments for configuration overrides.
#[derive(Parser, Debug, Clone)]
#[command(name = "queryloop")]
#[command(version, about = "Slow-query observation, analysis and feedback loop")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Store URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub store_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,queryloop_core=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Collector interval (overrides config file, e.g., "60s", "5m")
    #[arg(long, value_name = "DURATION")]
    pub collect_interval_secs: Option<String>,

    /// Analyzer interval (overrides config file)
    #[arg(long, value_name = "DURATION")]
    pub analyze_interval_secs: Option<String>,

    /// Learning interval (overrides config file)
    #[arg(long, value_name = "DURATION")]
    pub learn_interval_secs: Option<String>,

    /// Improvement threshold (overrides config file, e.g., "0.3")
    #[arg(long, value_name = "RATIO")]
    pub improvement_threshold: Option<f64>,

    /// Enable/disable the oracle collaborator (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub oracle_enabled: Option<bool>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file
    /// support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with `QUERYLOOP_`)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - QUERYLOOP_SERVER_HOST / QUERYLOOP_SERVER_PORT
    /// - QUERYLOOP_STORE_URL
    /// - QUERYLOOP_LOG_LEVEL
    /// - QUERYLOOP_COLLECT_INTERVAL_SEC / QUERYLOOP_ANALYZE_INTERVAL_SEC / QUERYLOOP_LEARN_INTERVAL_SEC
    /// - QUERYLOOP_IMPROVEMENT_THRESHOLD / QUERYLOOP_LEARN_MIN_SAMPLES / QUERYLOOP_LEARN_SAMPLE_SIZE
    /// - QUERYLOOP_LEARN_GRACE_MIN / QUERYLOOP_MAX_PENDING_AGE_DAYS / QUERYLOOP_MIN_BASELINE_MS
    /// - QUERYLOOP_PROBE_DEADLINE_SEC / QUERYLOOP_ANALYZER_CONCURRENCY / QUERYLOOP_ORACLE_MAX_RETRIES
    /// - QUERYLOOP_FEEDBACK_IDEMPOTENCY_HOURS / QUERYLOOP_CLAIM_TIMEOUT_SEC
    /// - QUERYLOOP_SCHEDULER_SHUTDOWN_GRACE_SEC / QUERYLOOP_ANALYZER_BATCH_SIZE
    /// - QUERYLOOP_PROBE_CONCURRENCY / QUERYLOOP_STORE_POOL_SIZE / QUERYLOOP_SCHEMA_CACHE_SIZE
    /// - QUERYLOOP_ORACLE_ENABLED / QUERYLOOP_ORACLE_BASE_URL / QUERYLOOP_ORACLE_API_KEY
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("QUERYLOOP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }
        if let Ok(port) = std::env::var("QUERYLOOP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(url) = std::env::var("QUERYLOOP_STORE_URL") {
            self.store.url = url;
            tracing::info!("Override store.url from env");
        }
        if let Ok(size) = std::env::var("QUERYLOOP_STORE_POOL_SIZE")
            && let Ok(size) = size.parse()
        {
            self.store.pool_size = size;
        }

        if let Ok(level) = std::env::var("QUERYLOOP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        apply_duration_env(
            "QUERYLOOP_COLLECT_INTERVAL_SEC",
            &mut self.scheduler.collect_interval_secs,
        );
        apply_duration_env(
            "QUERYLOOP_ANALYZE_INTERVAL_SEC",
            &mut self.scheduler.analyze_interval_secs,
        );
        apply_duration_env("QUERYLOOP_LEARN_INTERVAL_SEC", &mut self.scheduler.learn_interval_secs);
        apply_duration_env(
            "QUERYLOOP_SCHEDULER_SHUTDOWN_GRACE_SEC",
            &mut self.scheduler.shutdown_grace_secs,
        );
        apply_duration_env("QUERYLOOP_CLAIM_TIMEOUT_SEC", &mut self.scheduler.claim_timeout_secs);

        if let Ok(v) = std::env::var("QUERYLOOP_IMPROVEMENT_THRESHOLD")
            && let Ok(v) = v.parse()
        {
            self.learning.improvement_threshold = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_LEARN_MIN_SAMPLES")
            && let Ok(v) = v.parse()
        {
            self.learning.min_samples = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_LEARN_SAMPLE_SIZE")
            && let Ok(v) = v.parse()
        {
            self.learning.sample_size = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_LEARN_GRACE_MIN")
            && let Ok(v) = v.parse::<u64>()
        {
            self.learning.grace_secs = v * 60;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_MAX_PENDING_AGE_DAYS")
            && let Ok(v) = v.parse()
        {
            self.learning.max_pending_age_days = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_MIN_BASELINE_MS")
            && let Ok(v) = v.parse()
        {
            self.learning.min_baseline_ms = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_FEEDBACK_IDEMPOTENCY_HOURS")
            && let Ok(v) = v.parse::<u64>()
        {
            self.learning.feedback_idempotency_secs = v * 3600;
        }

        apply_duration_env("QUERYLOOP_PROBE_DEADLINE_SEC", &mut self.probe.deadline_secs);
        if let Ok(v) = std::env::var("QUERYLOOP_PROBE_CONCURRENCY")
            && let Ok(v) = v.parse()
        {
            self.probe.concurrency = v;
        }

        if let Ok(v) = std::env::var("QUERYLOOP_ANALYZER_CONCURRENCY")
            && let Ok(v) = v.parse()
        {
            self.analyzer.concurrency = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_ANALYZER_BATCH_SIZE")
            && let Ok(v) = v.parse()
        {
            self.analyzer.batch_size = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_ORACLE_MAX_RETRIES")
            && let Ok(v) = v.parse()
        {
            self.analyzer.oracle_max_retries = v;
        }

        if let Ok(v) = std::env::var("QUERYLOOP_SCHEMA_CACHE_SIZE")
            && let Ok(v) = v.parse()
        {
            self.oracle.schema_cache_size = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_ORACLE_ENABLED")
            && let Ok(v) = v.parse()
        {
            self.oracle.enabled = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_ORACLE_BASE_URL") {
            self.oracle.base_url = v;
        }
        if let Ok(v) = std::env::var("QUERYLOOP_ORACLE_API_KEY") {
            self.oracle.api_key = Some(v);
        }
    }

    /// Apply command line argument overrides (highest priority).
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.server_port {
            self.server.port = port;
        }
        if let Some(url) = &args.store_url {
            self.store.url = url.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(v) = &args.collect_interval_secs {
            match parse_duration_to_secs(v) {
                Ok(v) => self.scheduler.collect_interval_secs = v,
                Err(e) => tracing::warn!("Invalid --collect-interval-secs '{}': {}", v, e),
            }
        }
        if let Some(v) = &args.analyze_interval_secs {
            match parse_duration_to_secs(v) {
                Ok(v) => self.scheduler.analyze_interval_secs = v,
                Err(e) => tracing::warn!("Invalid --analyze-interval-secs '{}': {}", v, e),
            }
        }
        if let Some(v) = &args.learn_interval_secs {
            match parse_duration_to_secs(v) {
                Ok(v) => self.scheduler.learn_interval_secs = v,
                Err(e) => tracing::warn!("Invalid --learn-interval-secs '{}': {}", v, e),
            }
        }
        if let Some(v) = args.improvement_threshold {
            self.learning.improvement_threshold = v;
        }
        if let Some(v) = args.oracle_enabled {
            self.oracle.enabled = v;
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }
        if self.store.url.is_empty() {
            anyhow::bail!("store.url cannot be empty");
        }
        if self.scheduler.collect_interval_secs == 0
            || self.scheduler.analyze_interval_secs == 0
            || self.scheduler.learn_interval_secs == 0
        {
            anyhow::bail!("scheduler intervals must be > 0");
        }
        if !(0.0..=1.0).contains(&self.learning.improvement_threshold) {
            anyhow::bail!("learning.improvement_threshold must be within [0, 1]");
        }
        if self.learning.min_samples == 0 {
            anyhow::bail!("learning.min_samples must be > 0");
        }
        if self.learning.min_baseline_ms < 0.0 {
            anyhow::bail!("learning.min_baseline_ms must be >= 0");
        }
        if self.analyzer.min_recommendations == 0 {
            anyhow::bail!("analyzer.min_recommendations must be > 0");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths = ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

fn apply_duration_env(key: &str, slot: &mut u64) {
    if let Ok(raw) = std::env::var(key) {
        match parse_duration_to_secs(&raw) {
            Ok(v) => *slot = v,
            Err(e) => tracing::warn!("Invalid {} '{}': {} (keep {})", key, raw, e, slot),
        }
    }
}

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }
    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        "d" | "day" | "days" => Ok(n * 60 * 60 * 24),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

fn parse_days_to_i64(input: &str) -> Result<i64, String> {
    if let Ok(val) = input.parse::<i64>() {
        return Ok(val);
    }
    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: i64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "d" | "day" | "days" => Ok(n),
        "w" | "week" | "weeks" => Ok(n * 7),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '30s', '5m', '1h'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}

fn deserialize_days_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = i64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of days or a string like '7d' or '2w'")
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v as i64)
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_days_to_i64(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_days_to_i64(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = Config::default();
        config.scheduler.collect_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_human_duration() {
        assert_eq!(parse_duration_to_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_to_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("1h").unwrap(), 3600);
        assert_eq!(parse_duration_to_secs("90").unwrap(), 90);
    }

    #[test]
    fn parses_human_days() {
        assert_eq!(parse_days_to_i64("7d").unwrap(), 7);
        assert_eq!(parse_days_to_i64("2w").unwrap(), 14);
    }
}
