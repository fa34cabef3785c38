//! Alert kinds
//!
//! Every event the crawler reports to operators. Each kind knows its own
//! severity, wording and whether it is frequent enough to be rate limited.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::AlertSeverity;
use crate::models::InstanceId;

/// Event that produced an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    /// Crawl process started at `cursor`
    Startup { cursor: InstanceId },

    /// End of one crawl period and the sizing of the next
    PeriodSummary {
        median_lag_secs: f64,
        not_found_percent: f64,
        workers: usize,
        next_workers: usize,
        next_period_length: u64,
    },

    /// Recent misses clustered densely enough to switch strategy
    GapModeEntered {
        start: InstanceId,
        span: i64,
        density: f64,
    },

    /// Enough consecutive gap successes to resume normal crawling
    GapModeExited {
        successes: u32,
        earliest: InstanceId,
    },

    /// Gap mode gave up; the process stops
    GapModeExhausted { start: InstanceId, misses: u64 },

    /// An id exhausted every retry and went to the recovery log
    PermanentMiss { instance_id: InstanceId, gap: bool },

    /// The report is redacted for this caller
    AccessRestricted { instance_id: InstanceId },

    /// An escalated id is still failing in the offload lane
    OffloadWarning { instance_id: InstanceId, attempt: u32 },

    /// A report names a definition the store has never been seeded with
    UnknownDefinition {
        instance_id: InstanceId,
        definition_hash: u32,
    },

    /// The store refused a report for a reason retrying cannot fix
    WriteAborted { instance_id: InstanceId, reason: String },

    /// Result of a recovery-log reconcile pass
    ReconcileSummary { total: usize, found: usize, failed: usize },

    /// Unrecoverable error
    Fatal { reason: String },
}

impl AlertKind {
    /// Stable key, also used for rate limiting
    pub fn key(&self) -> &'static str {
        match self {
            Self::Startup { .. } => "startup",
            Self::PeriodSummary { .. } => "period_summary",
            Self::GapModeEntered { .. } => "gap_mode_entered",
            Self::GapModeExited { .. } => "gap_mode_exited",
            Self::GapModeExhausted { .. } => "gap_mode_exhausted",
            Self::PermanentMiss { .. } => "permanent_miss",
            Self::AccessRestricted { .. } => "access_restricted",
            Self::OffloadWarning { .. } => "offload_warning",
            Self::UnknownDefinition { .. } => "unknown_definition",
            Self::WriteAborted { .. } => "write_aborted",
            Self::ReconcileSummary { .. } => "reconcile_summary",
            Self::Fatal { .. } => "fatal",
        }
    }

    /// Short heading
    pub fn title(&self) -> &'static str {
        match self {
            Self::Startup { .. } => "Crawler started",
            Self::PeriodSummary { .. } => "Period summary",
            Self::GapModeEntered { .. } => "Gap mode entered",
            Self::GapModeExited { .. } => "Gap mode exited",
            Self::GapModeExhausted { .. } => "Gap mode exhausted",
            Self::PermanentMiss { .. } => "Missed instance",
            Self::AccessRestricted { .. } => "Access restricted",
            Self::OffloadWarning { .. } => "Offload warning",
            Self::UnknownDefinition { .. } => "Unknown activity definition",
            Self::WriteAborted { .. } => "Write aborted",
            Self::ReconcileSummary { .. } => "Reconcile finished",
            Self::Fatal { .. } => "Fatal error",
        }
    }

    pub fn severity(&self) -> AlertSeverity {
        match self {
            Self::Startup { .. }
            | Self::PeriodSummary { .. }
            | Self::GapModeExited { .. }
            | Self::ReconcileSummary { .. } => AlertSeverity::Info,
            Self::GapModeEntered { .. }
            | Self::PermanentMiss { .. }
            | Self::AccessRestricted { .. }
            | Self::OffloadWarning { .. } => AlertSeverity::Warning,
            Self::GapModeExhausted { .. }
            | Self::UnknownDefinition { .. }
            | Self::WriteAborted { .. }
            | Self::Fatal { .. } => AlertSeverity::Critical,
        }
    }

    /// Per-id kinds can arrive in bursts and are rate limited
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::PermanentMiss { .. }
                | Self::AccessRestricted { .. }
                | Self::OffloadWarning { .. }
                | Self::UnknownDefinition { .. }
                | Self::WriteAborted { .. }
        )
    }

    pub fn message(&self) -> String {
        match self {
            Self::Startup { cursor } => format!("Crawling forward from instance {cursor}"),
            Self::PeriodSummary {
                median_lag_secs,
                not_found_percent,
                workers,
                next_workers,
                next_period_length,
            } => format!(
                "Median lag {median_lag_secs:.0}s with {not_found_percent:.2}% not found on \
                 {workers} workers; next period {next_period_length} ids on {next_workers} workers"
            ),
            Self::GapModeEntered {
                start,
                span,
                density,
            } => format!(
                "Entering gap mode at instance {start}: misses span {span} ids (density {density:.3})"
            ),
            Self::GapModeExited {
                successes,
                earliest,
            } => format!(
                "Leaving gap mode after {successes} consecutive finds, earliest find {earliest}"
            ),
            Self::GapModeExhausted { start, misses } => format!(
                "Gap mode starting at instance {start} hit {misses} misses; crawler stopped"
            ),
            Self::PermanentMiss { instance_id, gap } => {
                let lane = if *gap { "gap" } else { "offload" };
                format!("Instance {instance_id} exhausted its {lane} retries")
            }
            Self::AccessRestricted { instance_id } => {
                format!("Instance {instance_id} is restricted and was skipped")
            }
            Self::OffloadWarning {
                instance_id,
                attempt,
            } => format!("Instance {instance_id} still failing after {attempt} offload attempts"),
            Self::UnknownDefinition {
                instance_id,
                definition_hash,
            } => format!(
                "Instance {instance_id} uses activity definition {definition_hash}, which is not \
                 registered; seed the definition and reconcile the missed log"
            ),
            Self::WriteAborted {
                instance_id,
                reason,
            } => format!("Instance {instance_id} could not be stored: {reason}"),
            Self::ReconcileSummary {
                total,
                found,
                failed,
            } => format!("Retried {total} missed instances: {found} found, {failed} still missing"),
            Self::Fatal { reason } => reason.clone(),
        }
    }

    /// Key fields for channels that render structured data
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        match self {
            Self::Startup { cursor } => {
                metadata.insert("cursor".into(), cursor.to_string());
            }
            Self::GapModeEntered { start, .. } | Self::GapModeExhausted { start, .. } => {
                metadata.insert("gap_start".into(), start.to_string());
            }
            Self::PermanentMiss { instance_id, .. }
            | Self::AccessRestricted { instance_id }
            | Self::OffloadWarning { instance_id, .. }
            | Self::WriteAborted { instance_id, .. } => {
                metadata.insert("instance_id".into(), instance_id.to_string());
            }
            Self::UnknownDefinition {
                instance_id,
                definition_hash,
            } => {
                metadata.insert("instance_id".into(), instance_id.to_string());
                metadata.insert("definition_hash".into(), definition_hash.to_string());
            }
            _ => {}
        }
        metadata
    }
}
