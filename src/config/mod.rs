//! Configuration management for the raidcrawl crawler
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Every tuning constant of the controller, gap mode
//! and retry policy lives here rather than in code.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::report::freshness::Epochs;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream report API
    pub api: ApiConfig,

    /// Adaptive crawl controller
    pub crawler: CrawlerConfig,

    /// Gap mode sub-controller
    pub gap: GapConfig,

    /// Patient retry lane for escalated ids
    pub offload: OffloadConfig,

    /// Freshness epoch boundaries
    pub freshness: Epochs,

    /// Primary store
    pub database: DatabaseConfig,

    /// Analytical store and batcher
    pub analytics: AnalyticsConfig,

    /// Message broker
    pub broker: BrokerConfig,

    /// Recovery log and reconcile pass
    pub recovery: RecoveryConfig,

    /// Alert delivery
    pub alerts: AlertConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics endpoint
    pub metrics: MetricsConfig,
}

/// Upstream report API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the platform API
    pub base_url: String,

    /// API key sent as `X-API-KEY`
    pub api_key: String,

    /// Requests per second across all workers
    pub requests_per_second: u32,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Activity mode that is stored; everything else is `NotMatchingType`
    pub tracked_mode: i32,

    /// User agent string
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://stats.bungie.net"),
            api_key: String::new(),
            requests_per_second: 250,
            request_timeout_secs: 30,
            tracked_mode: 4,
            user_agent: format!("raidcrawl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Crawl controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Worker count of the first period
    pub start_workers: usize,

    /// Lower clamp for the worker count
    pub min_workers: usize,

    /// Upper clamp for the worker count
    pub max_workers: usize,

    /// Length of the first period
    pub initial_period_length: u64,

    /// Smallest period length when scaling up
    pub period_floor: u64,

    /// Median lag the controller steers toward, in seconds
    pub lag_target_secs: f64,

    /// Not-found fraction tolerated before shrinking
    pub not_found_floor: f64,

    /// Gain applied to the excess not-found fraction
    pub decrease_gain: f64,

    /// Largest fractional worker reduction in one period
    pub max_decrease: f64,

    /// Period length per worker after a shrink
    pub ids_per_worker: u64,

    /// How far behind the stored maximum to start when no cursor is given
    pub start_buffer: i64,

    /// Base delay of the randomized worker backoff
    pub retry_base_ms: u64,

    /// Not-found responses tolerated before escalation
    pub not_found_limit: u32,

    /// Transient errors tolerated before escalation
    pub error_limit: u32,

    /// Pause after an upstream-disabled response
    pub disabled_cooldown_secs: u64,

    /// Capacity of the per-period job queue
    pub job_queue_capacity: usize,

    /// Lag samples retained per worker
    pub lag_window: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            start_workers: 50,
            min_workers: 5,
            max_workers: 200,
            initial_period_length: 50_000,
            period_floor: 10_000,
            lag_target_secs: 30.0,
            not_found_floor: 0.032,
            decrease_gain: 6.25,
            max_decrease: 0.8,
            ids_per_worker: 500,
            start_buffer: 10_000,
            retry_base_ms: 5_000,
            not_found_limit: 4,
            error_limit: 3,
            disabled_cooldown_secs: 45,
            job_queue_capacity: 5,
            lag_window: 50,
        }
    }
}

/// Gap mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Number of recent terminal misses kept for the density check
    pub miss_window: usize,

    /// Density at or above which gap mode is entered
    pub trigger_density: f64,

    /// Size of the gap worker pool
    pub workers: usize,

    /// Consecutive successes that end gap mode
    pub exit_successes: u32,

    /// Cumulative gap misses that abort the process
    pub miss_ceiling: u64,

    /// Not-found responses tolerated per id
    pub not_found_limit: u32,

    /// Attempts per id
    pub attempt_limit: u32,

    /// Pause after an upstream-disabled response
    pub disabled_cooldown_secs: u64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            miss_window: 25,
            trigger_density: 0.2,
            workers: 500,
            exit_successes: 100,
            miss_ceiling: 100_000,
            not_found_limit: 2,
            attempt_limit: 5,
            disabled_cooldown_secs: 30,
        }
    }
}

/// Offload lane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Attempts per escalated id
    pub max_attempts: u32,

    /// Pause after an upstream-disabled response (does not consume an attempt)
    pub disabled_cooldown_secs: u64,

    /// Attempt at which a warning alert is raised
    pub warn_attempt: u32,

    /// Backoff unit; attempt `i` waits `unit * i * i` seconds
    pub backoff_unit_secs: u64,

    /// Capacity of the escalation channel
    pub queue_capacity: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            disabled_cooldown_secs: 60,
            warn_attempt: 3,
            backoff_unit_secs: 8,
            queue_capacity: 10_000,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub postgres_url: String,

    /// Maximum pool size
    pub pool_size: usize,

    /// Replays of a transaction that hit a serialization conflict
    pub commit_retries: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            postgres_url: String::from("postgresql://localhost/raidcrawl"),
            pool_size: 32,
            commit_retries: 3,
        }
    }
}

/// Analytical store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// ClickHouse HTTP endpoint
    pub clickhouse_url: String,

    /// Target table
    pub table: String,

    /// Optional credentials
    pub user: Option<String>,
    pub password: Option<String>,

    /// Records per size-triggered flush
    pub batch_size: usize,

    /// Seconds between timer-triggered flushes
    pub batch_window_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            clickhouse_url: String::from("http://localhost:8123"),
            table: String::from("instance"),
            user: None,
            password: None,
            batch_size: 8192,
            batch_window_secs: 30,
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub redis_url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Key prefix for namespacing
    pub key_prefix: String,

    /// Seconds a blocking consume waits before polling again
    pub consume_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: String::from("redis://localhost:6379"),
            pool_size: 16,
            key_prefix: String::from("raidcrawl"),
            consume_timeout_secs: 5,
        }
    }
}

/// Recovery log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Append-only file of ids that exhausted every retry
    pub missed_log_path: PathBuf,

    /// Concurrent re-attempts during a reconcile pass
    pub reconcile_workers: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            missed_log_path: PathBuf::from("logs/missed.log"),
            reconcile_workers: 100,
        }
    }
}

/// Alert delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Webhook endpoint; alerts are only logged when unset
    pub webhook_url: Option<String>,

    /// Miss alerts allowed per window
    pub miss_alert_burst: u32,

    /// Window for miss alerts in seconds
    pub miss_alert_window_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            miss_alert_burst: 5,
            miss_alert_window_secs: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics`
    pub enabled: bool,

    /// Listen port
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("RAIDCRAWL_API_URL") {
            config.api.base_url = url;
        }
        if let Ok(key) = std::env::var("BUNGIE_API_KEY") {
            config.api.api_key = key;
        }
        if let Some(rps) = env_parse("RAIDCRAWL_RATE_LIMIT") {
            config.api.requests_per_second = rps;
        }
        if let Some(timeout) = env_parse("RAIDCRAWL_REQUEST_TIMEOUT") {
            config.api.request_timeout_secs = timeout;
        }

        if let Some(workers) = env_parse("RAIDCRAWL_WORKERS") {
            config.crawler.start_workers = workers;
        }
        if let Some(buffer) = env_parse("RAIDCRAWL_BUFFER") {
            config.crawler.start_buffer = buffer;
        }
        if let Some(max) = env_parse("RAIDCRAWL_MAX_WORKERS") {
            config.crawler.max_workers = max;
        }
        if let Some(delay) = env_parse("RAIDCRAWL_RETRY_DELAY_MS") {
            config.crawler.retry_base_ms = delay;
        }
        if let Some(workers) = env_parse("RAIDCRAWL_GAP_WORKERS") {
            config.gap.workers = workers;
        }

        if let Ok(url) = std::env::var("DATABASE_URL").or_else(|_| std::env::var("POSTGRES_URL")) {
            config.database.postgres_url = url;
        }
        if let Some(size) = env_parse("DB_POOL_SIZE") {
            config.database.pool_size = size;
        }

        if let Ok(url) = std::env::var("CLICKHOUSE_URL") {
            config.analytics.clickhouse_url = url;
        }
        config.analytics.user = std::env::var("CLICKHOUSE_USER").ok();
        config.analytics.password = std::env::var("CLICKHOUSE_PASSWORD").ok();
        if let Some(size) = env_parse("RAIDCRAWL_BATCH_SIZE") {
            config.analytics.batch_size = size;
        }
        if let Some(window) = env_parse("RAIDCRAWL_BATCH_WINDOW") {
            config.analytics.batch_window_secs = window;
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.broker.redis_url = url;
        }
        if let Some(size) = env_parse("REDIS_POOL_SIZE") {
            config.broker.pool_size = size;
        }

        if let Ok(path) = std::env::var("RAIDCRAWL_MISSED_LOG") {
            config.recovery.missed_log_path = PathBuf::from(path);
        }

        config.alerts.webhook_url = std::env::var("ALERT_WEBHOOK_URL").ok();

        if let Ok(level) = std::env::var("RAIDCRAWL_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("RAIDCRAWL_LOG_FORMAT") {
            config.logging.format = format;
        }
        if let Some(port) = env_parse("RAIDCRAWL_METRICS_PORT") {
            config.metrics.port = port;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.api.requests_per_second == 0 {
            return Err(Error::config("requests_per_second must be greater than 0"));
        }

        if self.crawler.min_workers == 0 {
            return Err(Error::config("min_workers must be greater than 0"));
        }

        if self.crawler.min_workers > self.crawler.max_workers {
            return Err(Error::config(format!(
                "min_workers ({}) must not exceed max_workers ({})",
                self.crawler.min_workers,
                self.crawler.max_workers
            )));
        }

        if self.crawler.initial_period_length == 0 {
            return Err(Error::config("initial_period_length must be greater than 0"));
        }

        if !(0.0..1.0).contains(&self.crawler.max_decrease) {
            return Err(Error::config("max_decrease must be in [0, 1)"));
        }

        if self.crawler.job_queue_capacity == 0 || self.crawler.lag_window == 0 {
            return Err(Error::config("job_queue_capacity and lag_window must be greater than 0"));
        }

        if self.gap.miss_window < 2 {
            return Err(Error::config("gap miss_window must hold at least 2 ids"));
        }

        if self.gap.workers == 0 || self.gap.exit_successes == 0 {
            return Err(Error::config("gap workers and exit_successes must be greater than 0"));
        }

        if self.offload.max_attempts == 0 {
            return Err(Error::config("offload max_attempts must be greater than 0"));
        }

        if self.database.pool_size == 0 {
            return Err(Error::config("pool_size must be greater than 0"));
        }

        if self.analytics.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than 0"));
        }

        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    /// Get batch window as Duration
    #[must_use]
    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.analytics.batch_window_secs)
    }
}
