//! Prometheus metrics for the crawler
//!
//! This module provides metrics tracking for:
//! - Fetch attempts: outcome by attempt count, latency, upstream error codes
//! - Live edge: completion lag of every found report, active workers, gap mode
//! - Writes: primary store results and analytical batch flushes
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

pub mod server;

use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

use crate::report::classify::Outcome;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all crawler metrics
struct CrawlerMetrics {
    crawl_status: CounterVec,
    fetch_duration: HistogramVec,
    completion_lag: Histogram,
    active_workers: Gauge,
    upstream_error_codes: CounterVec,
    store_results: CounterVec,
    batch_flushes: CounterVec,
    gap_mode: Gauge,
}

/// Global storage for crawler metrics
static CRAWLER_METRICS: OnceLock<CrawlerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = raidcrawl::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let crawler = CrawlerMetrics {
        crawl_status: register_counter_vec!(
            "raidcrawl_crawl_status_total",
            "Fetch outcomes by attempt count",
            &["status", "attempts"]
        )?,
        fetch_duration: register_histogram_vec!(
            "raidcrawl_fetch_duration_seconds",
            "Report fetch latency in seconds",
            &["outcome"],
            vec![0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
        completion_lag: register_histogram!(
            "raidcrawl_completion_lag_seconds",
            "Wall clock time between a report's completion and its retrieval",
            vec![5.0, 10.0, 20.0, 30.0, 45.0, 60.0, 120.0, 300.0, 900.0, 3600.0, 86400.0]
        )?,
        active_workers: register_gauge!(
            "raidcrawl_active_workers",
            "Fetch workers in the current period"
        )?,
        upstream_error_codes: register_counter_vec!(
            "raidcrawl_upstream_error_code_total",
            "Platform error codes seen in responses",
            &["code"]
        )?,
        store_results: register_counter_vec!(
            "raidcrawl_store_total",
            "Primary store write results",
            &["result"]
        )?,
        batch_flushes: register_counter_vec!(
            "raidcrawl_batch_flush_total",
            "Analytical store batch flushes",
            &["result"]
        )?,
        gap_mode: register_gauge!(
            "raidcrawl_gap_mode",
            "Whether the crawler is in gap mode (1 = yes, 0 = no)"
        )?,
    };

    CRAWLER_METRICS
        .set(crawler)
        .map_err(|_| "Crawler metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    CRAWLER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one classified fetch attempt
pub fn record_attempt(outcome: Outcome, attempt: u32, elapsed: Duration) {
    let Some(m) = CRAWLER_METRICS.get() else {
        return;
    };

    let attempts = (attempt + 1).to_string();
    m.crawl_status
        .with_label_values(&[outcome.as_str(), attempts.as_str()])
        .inc();
    m.fetch_duration
        .with_label_values(&[outcome.as_str()])
        .observe(elapsed.as_secs_f64());
}

/// Record the lag of a found report
pub fn record_lag(lag: Duration) {
    if let Some(m) = CRAWLER_METRICS.get() {
        m.completion_lag.observe(lag.as_secs_f64());
    }
}

/// Record a platform error code
pub fn record_error_code(code: i32) {
    if let Some(m) = CRAWLER_METRICS.get() {
        m.upstream_error_codes
            .with_label_values(&[code.to_string().as_str()])
            .inc();
    }
}

/// Set the number of workers of the running period
pub fn set_active_workers(workers: usize) {
    if let Some(m) = CRAWLER_METRICS.get() {
        m.active_workers.set(workers as f64);
    }
}

/// Record a primary store write result (`inserted`, `duplicate`, `failed`)
pub fn record_store(result: &str) {
    if let Some(m) = CRAWLER_METRICS.get() {
        m.store_results.with_label_values(&[result]).inc();
    }
}

/// Record an analytical flush result (`ok`, `failed`)
pub fn record_flush(result: &str) {
    if let Some(m) = CRAWLER_METRICS.get() {
        m.batch_flushes.with_label_values(&[result]).inc();
    }
}

/// Flip the gap mode gauge
pub fn set_gap_mode(active: bool) {
    if let Some(m) = CRAWLER_METRICS.get() {
        m.gap_mode.set(if active { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encoded_series_names() {
        ensure_metrics_initialized();
        record_attempt(Outcome::NotFound, 0, Duration::from_millis(120));
        record_store("inserted");
        set_gap_mode(true);

        let text = encode_metrics().unwrap();
        assert!(text.contains("raidcrawl_crawl_status_total"));
        assert!(text.contains("status=\"not_found\""));
        assert!(text.contains("raidcrawl_gap_mode 1"));
    }

    #[test]
    fn test_recording_does_not_panic() {
        ensure_metrics_initialized();
        record_lag(Duration::from_secs(42));
        record_error_code(1653);
        set_active_workers(50);
        record_flush("ok");
    }
}
