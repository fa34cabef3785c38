//! raidcrawl - adaptive carnage report crawler
//!
//! Follows the live edge of a dense, monotonically assigned id space of
//! played matches, fetching each match's carnage report, normalizing it and
//! committing it together with per-player aggregate statistics. Normalized
//! activities are also batched into a columnar store for analytics.
//!
//! # Architecture
//!
//! - [`config`] - Configuration management and tuning constants
//! - [`crawler`] - Workers, adaptive controller, gap mode and offload lane
//! - [`report`] - Outcome classification, freshness and normalization
//! - [`storage`] - Transactional writer, primary stores and recovery log
//! - [`queue`] - Broker seam for analytics and backfill messages
//! - [`analytics`] - Batched inserts into the analytical store
//! - [`notifications`] - Operational alerts
//! - [`metrics`] - Prometheus series and the `/metrics` endpoint
//! - [`models`] - Normalized activity records
//! - [`utils`] - Domain errors and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use raidcrawl::config::Config;
//! use raidcrawl::crawler::{ReportFetcher, ThrottleGate};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let fetcher = ReportFetcher::new(&config.api, Arc::new(ThrottleGate::new()))?;
//!     let classification = fetcher.fetch(14_000_000_000).await;
//!     println!("{}", classification.outcome);
//!     Ok(())
//! }
//! ```

pub mod analytics;
pub mod config;
pub mod crawler;
pub mod error;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod queue;
pub mod report;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crawler::{CrawlController, ReportFetcher, ReportPipeline};
    pub use crate::error::{CrawlErrorTrait, Error, ErrorCategory, Result};
    pub use crate::models::{Freshness, InstanceId, NormalizedActivity};
    pub use crate::report::classify::Outcome;
    pub use crate::storage::{ActivityStore, ActivityWriter, WriteOutcome};
}

pub use models::{InstanceId, NormalizedActivity};
