use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CACHE_CAPACITY: usize = 10_000;
const DEFAULT_SESSION_TTL_MINUTES: i64 = 60;
const DEFAULT_SESSION_SNAPSHOT_TTL_SECS: u64 = 24 * 3600;
const DEFAULT_IDEMPOTENCY_RETENTION_DAYS: i64 = 30;
const DEFAULT_DELIVERY_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 500;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Cache configuration
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CacheConfig {
    /// Type of cache to use: "in-memory" or "redis"
    #[serde(default = "default_cache_type")]
    pub cache_type: String,

    /// Redis connection URL for cache
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Maximum number of in-memory cache entries
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// Default TTL for cache entries in seconds
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: default_cache_type(),
            redis_url: default_redis_url(),
            capacity: DEFAULT_CACHE_CAPACITY,
            default_ttl_secs: Some(300),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Shared secret used to verify inbound PSP webhook signatures
    #[serde(default)]
    pub psp_webhook_secret: Option<String>,

    /// Allowed clock skew when verifying PSP webhook timestamps (seconds)
    #[serde(default = "default_psp_webhook_tolerance_secs")]
    pub psp_webhook_tolerance_secs: u64,

    /// Platform fee taken on each settled payment, in percent (e.g. "2.9")
    #[serde(default = "default_platform_fee_percent")]
    pub platform_fee_percent: String,

    /// Default checkout session lifetime in minutes
    #[serde(default = "default_session_ttl_minutes")]
    pub session_ttl_minutes: i64,

    /// TTL for cached session snapshots in seconds
    #[serde(default = "default_session_snapshot_ttl_secs")]
    pub session_snapshot_ttl_secs: u64,

    /// Days before idempotency records become reclaimable
    #[serde(default = "default_idempotency_retention_days")]
    pub idempotency_retention_days: i64,

    /// Webhook delivery: attempt ceiling before a delivery is marked failed
    #[serde(default = "default_delivery_max_attempts")]
    pub delivery_max_attempts: i32,

    /// Webhook delivery: per-request timeout in seconds
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,

    /// Webhook dispatcher poll interval in milliseconds
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Interval for the session-expiry and idempotency-cleanup sweeps (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Default currency for sessions that do not specify one
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Capacity of the in-process domain event channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_cache_type() -> String {
    "in-memory".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_psp_webhook_tolerance_secs() -> u64 {
    300
}
fn default_platform_fee_percent() -> String {
    "2.9".to_string()
}
fn default_session_ttl_minutes() -> i64 {
    DEFAULT_SESSION_TTL_MINUTES
}
fn default_session_snapshot_ttl_secs() -> u64 {
    DEFAULT_SESSION_SNAPSHOT_TTL_SECS
}
fn default_idempotency_retention_days() -> i64 {
    DEFAULT_IDEMPOTENCY_RETENTION_DAYS
}
fn default_delivery_max_attempts() -> i32 {
    DEFAULT_DELIVERY_MAX_ATTEMPTS
}
fn default_delivery_timeout_secs() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_SECS
}
fn default_dispatch_interval_ms() -> u64 {
    DEFAULT_DISPATCH_INTERVAL_MS
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_event_channel_capacity() -> usize {
    1024
}

impl AppConfig {
    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Creates a new configuration, primarily for tests and tools.
    pub fn new(
        database_url: String,
        redis_url: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            redis_url: redis_url.clone(),
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            cache: CacheConfig {
                redis_url,
                ..Default::default()
            },
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            psp_webhook_secret: None,
            psp_webhook_tolerance_secs: default_psp_webhook_tolerance_secs(),
            platform_fee_percent: default_platform_fee_percent(),
            session_ttl_minutes: default_session_ttl_minutes(),
            session_snapshot_ttl_secs: default_session_snapshot_ttl_secs(),
            idempotency_retention_days: default_idempotency_retention_days(),
            delivery_max_attempts: default_delivery_max_attempts(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_currency: default_currency(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "test"
    }

    /// Platform fee as a decimal fraction (2.9% -> 0.029).
    pub fn platform_fee_rate(&self) -> rust_decimal::Decimal {
        use std::str::FromStr;
        rust_decimal::Decimal::from_str(&self.platform_fee_percent)
            .unwrap_or_else(|_| rust_decimal::Decimal::ZERO)
            / rust_decimal::Decimal::from(100)
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let builder = Config::builder()
        .set_default("database_url", "sqlite://hostedpay.db?mode=rwc")?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false));

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

/// Initializes the global tracing subscriber from the loaded configuration.
pub fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::fmt;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    if config.log_json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn platform_fee_rate_parses_percentage() {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "redis://127.0.0.1:6379".into(),
            "127.0.0.1".into(),
            8080,
            "test".into(),
        );
        cfg.platform_fee_percent = "2.9".into();
        assert_eq!(cfg.platform_fee_rate(), dec!(0.029));
    }

    #[test]
    fn unparseable_fee_falls_back_to_zero() {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "redis://127.0.0.1:6379".into(),
            "127.0.0.1".into(),
            8080,
            "test".into(),
        );
        cfg.platform_fee_percent = "nonsense".into();
        assert_eq!(cfg.platform_fee_rate(), rust_decimal::Decimal::ZERO);
    }
}
