//! Configuration management for property-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::EntityKind;

/// Environment variable prefix for `Config::from_env`
const ENV_PREFIX: &str = "PROPERTY_SYNC_";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Admin HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Upstream property-management API
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Retry policy for upstream calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Pagination pacing
    #[serde(default)]
    pub paginator: PaginatorConfig,

    /// Scheduler and orchestrator settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Dead letter queue settings
    #[serde(default)]
    pub dlq: DlqConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix PROPERTY_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(host) = env_var("SERVER_HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_var("SERVER_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid port number".to_string()))?;
        }

        if let Some(path) = env_var("DATABASE_PATH") {
            config.database.path = path;
        }

        if let Some(url) = env_var("UPSTREAM_BASE_URL") {
            config.upstream.base_url = Some(url);
        }
        if let Some(token) = env_var("UPSTREAM_API_TOKEN") {
            config.upstream.api_token = Some(token);
        }
        if let Some(timeout) = env_var("UPSTREAM_TIMEOUT_MS") {
            config.upstream.timeout_ms = timeout
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid upstream timeout".to_string()))?;
        }

        if let Some(enabled) = env_var("SYNC_ENABLED") {
            config.sync.enabled = enabled.parse().unwrap_or(false);
        }
        if let Some(interval) = env_var("SYNC_INTERVAL_SECS") {
            config.sync.interval_secs = interval
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid sync interval".to_string()))?;
        }
        if let Some(hour) = env_var("SYNC_FULL_SYNC_HOUR_UTC") {
            config.sync.full_sync_hour_utc = hour
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid full sync hour".to_string()))?;
        }
        if let Some(entities) = env_var("SYNC_ENTITIES") {
            config.sync.entities = parse_entity_list(&entities)?;
        }

        if let Some(enabled) = env_var("OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Some(endpoint) = env_var("OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        if let Some(level) = env_var("LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.full_sync_hour_utc > 23 {
            return Err(ConfigError::InvalidValue(format!(
                "sync.full_sync_hour_utc must be 0-23, got {}",
                self.sync.full_sync_hour_utc
            )));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.interval_secs must be positive".to_string(),
            ));
        }
        if self.upstream.page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "upstream.page_size must be positive".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "breaker.failure_threshold must be positive".to_string(),
            ));
        }
        if self.retry.growth < 1.0 {
            return Err(ConfigError::InvalidValue(format!(
                "retry.growth must be >= 1.0, got {}",
                self.retry.growth
            )));
        }
        Ok(())
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, suffix)).ok()
}

fn parse_entity_list(raw: &str) -> Result<Vec<EntityKind>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<EntityKind>()
                .map_err(|_| ConfigError::InvalidValue(format!("Unknown entity: {}", s)))
        })
        .collect()
}

/// Admin HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file, or `:memory:`
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "/data/db/property-sync.db".to_string()
}

/// Upstream API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL of the property-management API
    pub base_url: Option<String>,

    /// Static bearer credential
    pub api_token: Option<String>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl UpstreamConfig {
    /// True when both the base URL and the bearer credential are set
    pub fn has_credentials(&self) -> bool {
        matches!(&self.base_url, Some(u) if !u.is_empty())
            && matches!(&self.api_token, Some(t) if !t.is_empty())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            timeout_ms: default_timeout_ms(),
            page_size: default_page_size(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_page_size() -> u32 {
    200
}

/// Retry configuration for upstream calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff growth factor per attempt
    #[serde(default = "default_growth")]
    pub growth: f64,

    /// Upper bound for a single backoff in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Whether to add 0-10% random jitter to each backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            growth: default_growth(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_growth() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive 5xx responses before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before the next call may probe
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

/// Pagination pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaginatorConfig {
    /// Delay between pages in milliseconds
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    /// Delay between pages when the rate-limit budget is low
    #[serde(default = "default_low_budget_delay_ms")]
    pub low_budget_delay_ms: u64,

    /// Remaining-request count below which the budget counts as low
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: u64,

    /// Hard cap on pages fetched for one entity
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            page_delay_ms: default_page_delay_ms(),
            low_budget_delay_ms: default_low_budget_delay_ms(),
            low_water_mark: default_low_water_mark(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_page_delay_ms() -> u64 {
    250
}

fn default_low_budget_delay_ms() -> u64 {
    5_000
}

fn default_low_water_mark() -> u64 {
    10
}

fn default_max_pages() -> u32 {
    10_000
}

/// Scheduler and orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Whether scheduled syncs run at all
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between scheduler ticks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Delay before the first tick after startup
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// UTC hour from which the daily full sync may run
    #[serde(default = "default_full_sync_hour_utc")]
    pub full_sync_hour_utc: u32,

    /// Lookback used for entities without a cursor
    #[serde(default = "default_fallback_window_days")]
    pub fallback_window_days: i64,

    /// Lease lifetime for the advisory sync lock
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Entities synced by scheduled runs, in order
    #[serde(default = "default_entities")]
    pub entities: Vec<EntityKind>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
            full_sync_hour_utc: default_full_sync_hour_utc(),
            fallback_window_days: default_fallback_window_days(),
            lock_ttl_secs: default_lock_ttl_secs(),
            entities: default_entities(),
        }
    }
}

fn default_interval_secs() -> u64 {
    900
}

fn default_initial_delay_secs() -> u64 {
    10
}

fn default_full_sync_hour_utc() -> u32 {
    2
}

fn default_fallback_window_days() -> i64 {
    30
}

fn default_lock_ttl_secs() -> u64 {
    840
}

fn default_entities() -> Vec<EntityKind> {
    EntityKind::all().to_vec()
}

/// Dead letter queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqConfig {
    /// Reprocessing attempts within a single requeue
    #[serde(default = "default_dlq_max_attempts")]
    pub max_attempts: u32,

    /// Base of the whole-second exponential backoff between attempts
    #[serde(default = "default_dlq_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Requeues allowed per item before it is refused
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_dlq_max_attempts(),
            backoff_base_secs: default_dlq_backoff_base_secs(),
            max_retries: default_dlq_max_retries(),
        }
    }
}

fn default_dlq_max_attempts() -> u32 {
    3
}

fn default_dlq_backoff_base_secs() -> u64 {
    1
}

fn default_dlq_max_retries() -> u32 {
    5
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Option<String>,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "property-sync".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`json` or `pretty`)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax; unknown variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
