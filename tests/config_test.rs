//! Tests for configuration loading

use serial_test::serial;
use std::path::{Path, PathBuf};

use raidcrawl::config::Config;

const ENV_KEYS: &[&str] = &[
    "BUNGIE_API_KEY",
    "RAIDCRAWL_WORKERS",
    "RAIDCRAWL_MAX_WORKERS",
    "RAIDCRAWL_GAP_WORKERS",
    "RAIDCRAWL_BATCH_SIZE",
    "RAIDCRAWL_MISSED_LOG",
    "DATABASE_URL",
    "POSTGRES_URL",
    "CLICKHOUSE_URL",
    "ALERT_WEBHOOK_URL",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

#[test]
fn test_config_file_matches_defaults() {
    let config = Config::from_file(Path::new("config.toml")).expect("config.toml should parse");
    config.validate().unwrap();

    let defaults = Config::default();
    assert_eq!(config.crawler.start_workers, defaults.crawler.start_workers);
    assert_eq!(config.crawler.retry_base_ms, 5_000);
    assert_eq!(config.gap.miss_window, 25);
    assert_eq!(config.gap.exit_successes, 100);
    assert_eq!(config.offload.max_attempts, 5);
    assert_eq!(config.analytics.batch_size, 8_192);
    assert_eq!(config.freshness, defaults.freshness);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.toml");
    std::fs::write(&path, "[crawler]\nmax_workers = 64\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.crawler.max_workers, 64);
    assert_eq!(config.crawler.min_workers, 5);
    assert_eq!(config.gap.workers, 500);
}

#[test]
fn test_unparsable_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[crawler\nmax_workers = ").unwrap();

    assert!(Config::from_file(&path).is_err());
    assert!(Config::from_file(&dir.path().join("missing.toml")).is_err());
}

#[test]
#[serial]
fn test_from_env_overrides() {
    clear_env();
    std::env::set_var("BUNGIE_API_KEY", "abc123");
    std::env::set_var("RAIDCRAWL_WORKERS", "80");
    std::env::set_var("RAIDCRAWL_GAP_WORKERS", "250");
    std::env::set_var("RAIDCRAWL_MISSED_LOG", "/var/log/raidcrawl/missed.log");
    std::env::set_var("DATABASE_URL", "postgresql://db/raids");
    std::env::set_var("ALERT_WEBHOOK_URL", "https://hooks.example.com/alerts");

    let config = Config::from_env().unwrap();
    clear_env();

    assert_eq!(config.api.api_key, "abc123");
    assert_eq!(config.crawler.start_workers, 80);
    assert_eq!(config.gap.workers, 250);
    assert_eq!(
        config.recovery.missed_log_path,
        PathBuf::from("/var/log/raidcrawl/missed.log")
    );
    assert_eq!(config.database.postgres_url, "postgresql://db/raids");
    assert_eq!(
        config.alerts.webhook_url.as_deref(),
        Some("https://hooks.example.com/alerts")
    );
}

#[test]
#[serial]
fn test_from_env_ignores_unparsable_numbers() {
    clear_env();
    std::env::set_var("RAIDCRAWL_MAX_WORKERS", "lots");
    std::env::set_var("RAIDCRAWL_BATCH_SIZE", "4096");

    let config = Config::from_env().unwrap();
    clear_env();

    assert_eq!(config.crawler.max_workers, 200);
    assert_eq!(config.analytics.batch_size, 4_096);
    assert!(config.validate().is_ok());
}
