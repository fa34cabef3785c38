//! One attempt at one instance id
//!
//! Fetch, classify, normalize and write. The result is a single [`Outcome`]
//! plus the completion lag when the report was readable. Retry decisions are
//! left to the caller's [`crate::crawler::policy::RetryPolicy`].
//!
//! ```text
//! fetch ──▶ classify ──▶ normalize ──▶ write ──▶ Outcome + lag
//!                │              │           │
//!           not found,      Malformed   Duplicate,
//!           disabled, ...               Transient,
//!                                       Unwritable
//! ```
//!
//! A write error that another attempt cannot fix ends as
//! [`Outcome::Unwritable`] and raises a critical alert.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::fetcher::ReportFetcher;
use crate::error::CrawlErrorTrait;
use crate::metrics;
use crate::models::InstanceId;
use crate::notifications::{AlertKind, Alerter};
use crate::report::classify::{FetchedReport, Outcome};
use crate::report::freshness::Epochs;
use crate::report::normalize::normalize;
use crate::report::RawReport;
use crate::storage::{ActivityWriter, WriteOutcome};
use crate::utils::error::StoreError;

// ============================================================================
// Pipeline Statistics
// ============================================================================

/// Outcome counters across every attempt (thread-safe)
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub attempts: AtomicU64,
    pub stored: AtomicU64,
    pub duplicates: AtomicU64,
    pub not_matching: AtomicU64,
    pub not_found: AtomicU64,
    pub disabled: AtomicU64,
    pub restricted: AtomicU64,
    pub malformed: AtomicU64,
    pub transient: AtomicU64,
    pub unwritable: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, outcome: Outcome) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Success => &self.stored,
            Outcome::Duplicate => &self.duplicates,
            Outcome::NotMatchingType => &self.not_matching,
            Outcome::NotFound => &self.not_found,
            Outcome::UpstreamDisabled => &self.disabled,
            Outcome::AccessRestricted => &self.restricted,
            Outcome::Malformed => &self.malformed,
            Outcome::Transient => &self.transient,
            Outcome::Unwritable => &self.unwritable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            not_matching: self.not_matching.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            disabled: self.disabled.load(Ordering::Relaxed),
            restricted: self.restricted.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            transient: self.transient.load(Ordering::Relaxed),
            unwritable: self.unwritable.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub not_matching: u64,
    pub not_found: u64,
    pub disabled: u64,
    pub restricted: u64,
    pub malformed: u64,
    pub transient: u64,
    pub unwritable: u64,
}

impl StatsSnapshot {
    /// Attempts that settled their id
    pub fn found(&self) -> u64 {
        self.stored + self.duplicates + self.not_matching
    }
}

// ============================================================================
// Pipeline Implementation
// ============================================================================

/// Result of one attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    pub outcome: Outcome,
    /// Time since the reported completion, for readable reports
    pub lag: Option<Duration>,
}

/// Fetch-to-store path shared by every worker flavour
pub struct ReportPipeline {
    fetcher: Arc<ReportFetcher>,
    writer: Arc<ActivityWriter>,
    epochs: Epochs,
    stats: Arc<PipelineStats>,
    alerter: Arc<Alerter>,
}

impl ReportPipeline {
    pub fn new(fetcher: Arc<ReportFetcher>, writer: Arc<ActivityWriter>, epochs: Epochs) -> Self {
        Self {
            fetcher,
            writer,
            epochs,
            stats: PipelineStats::new(),
            alerter: Arc::new(Alerter::disabled()),
        }
    }

    /// Raise alerts for reports the store refuses
    pub fn with_alerter(mut self, alerter: Arc<Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn writer(&self) -> &Arc<ActivityWriter> {
        &self.writer
    }

    /// Run attempt number `attempt` (zero-based) for one id
    pub async fn attempt(&self, instance_id: InstanceId, attempt: u32) -> Attempt {
        let started = Instant::now();
        let classification = self.fetcher.fetch(instance_id).await;

        let (outcome, lag) = match (classification.outcome, classification.report) {
            (Outcome::Success, Some(fetched)) => {
                let lag = completion_lag(&fetched.report);
                (self.store(instance_id, fetched).await, lag)
            }
            (Outcome::NotMatchingType, Some(fetched)) => {
                (Outcome::NotMatchingType, completion_lag(&fetched.report))
            }
            (outcome, _) => {
                if let Some(detail) = &classification.detail {
                    tracing::debug!(
                        instance_id = instance_id,
                        outcome = %outcome,
                        detail = %detail,
                        "Report not usable"
                    );
                }
                (outcome, None)
            }
        };

        self.stats.record(outcome);
        metrics::record_attempt(outcome, attempt, started.elapsed());
        if let Some(lag) = lag {
            metrics::record_lag(lag);
        }

        Attempt { outcome, lag }
    }

    async fn store(&self, instance_id: InstanceId, fetched: FetchedReport) -> Outcome {
        let activity = match normalize(&fetched.report, &self.epochs) {
            Ok(activity) => activity,
            Err(e) => {
                tracing::warn!(instance_id = instance_id, error = %e, "Rejected malformed report");
                return Outcome::Malformed;
            }
        };

        match self.writer.write(activity, &fetched.payload).await {
            Ok(WriteOutcome::Inserted(activity)) => {
                tracing::info!(
                    instance_id = instance_id,
                    players = activity.player_count,
                    completed = activity.completed,
                    "Stored activity"
                );
                Outcome::Success
            }
            Ok(WriteOutcome::Duplicate) => Outcome::Duplicate,
            Err(e) if e.is_recoverable() => Outcome::Transient,
            Err(e) => {
                tracing::error!(
                    instance_id = instance_id,
                    category = e.category().as_str(),
                    error = %e,
                    "Write aborted"
                );
                self.alerter.notify(unwritable_alert(instance_id, &e));
                Outcome::Unwritable
            }
        }
    }
}

fn unwritable_alert(instance_id: InstanceId, error: &StoreError) -> AlertKind {
    match error {
        StoreError::UnknownDefinition(hash) => AlertKind::UnknownDefinition {
            instance_id,
            definition_hash: *hash,
        },
        other => AlertKind::WriteAborted {
            instance_id,
            reason: other.to_string(),
        },
    }
}

/// Wall-clock time since the report's completion, never negative
fn completion_lag(report: &RawReport) -> Option<Duration> {
    let completed = report.completed_at().ok()?;
    Some((Utc::now() - completed).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot_found() {
        let stats = PipelineStats::new();
        stats.record(Outcome::Success);
        stats.record(Outcome::Duplicate);
        stats.record(Outcome::NotFound);
        stats.record(Outcome::NotMatchingType);
        stats.record(Outcome::Unwritable);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempts, 5);
        assert_eq!(snapshot.unwritable, 1);
        assert_eq!(snapshot.found(), 3);
        assert_eq!(snapshot.not_found, 1);
    }
}
