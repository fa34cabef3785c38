//! Operational alerts
//!
//! Write-only observers of the crawler. Mode transitions, permanent misses
//! and fatal aborts are formatted into [`Alert`]s and pushed to every
//! registered [`Channel`]. Delivery failures are logged and never reach the
//! caller.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │      Alerter                               │
//! │  - Alert formatting per kind               │
//! │  - Per-kind rate limiting                  │
//! │  - Channel fan-out                         │
//! └────────────────────────────────────────────┘
//!                     │
//!                     ▼
//!               ┌─────────┐
//!               │ Webhook │
//!               │ Channel │
//!               └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use raidcrawl::notifications::{AlertKind, Alerter};
//!
//! let alerter = Alerter::from_config(&config.alerts)?;
//! alerter.notify(AlertKind::Startup { cursor: 14_000_000_000 });
//! ```

mod alerter;
pub mod channels;
mod kind;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// Re-exports
pub use alerter::Alerter;
pub use channels::webhook::WebhookChannel;
pub use channels::Channel;
pub use kind::AlertKind;

/// Severity level of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational alerts for tracking purposes
    Info,
    /// Warning alerts that require attention
    Warning,
    /// Critical alerts requiring immediate action
    Critical,
}

impl AlertSeverity {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Embed colour used by chat webhooks
    pub fn color(&self) -> u32 {
        match self {
            Self::Info => 0x3498db,
            Self::Warning => 0xf1c40f,
            Self::Critical => 0xe74c3c,
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One formatted alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert identifier
    pub id: String,
    /// What happened
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    /// Human readable summary
    pub message: String,
    /// Additional context
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Build the alert for one event
    pub fn new(kind: AlertKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            severity: kind.severity(),
            message: kind.message(),
            metadata: kind.metadata(),
            kind,
            created_at: Utc::now(),
        }
    }

    /// Add metadata to the alert
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Format alert for plain-text display
    pub fn format_message(&self) -> String {
        format!(
            "[{severity}] {title}: {message}",
            severity = self.severity.as_str().to_uppercase(),
            title = self.kind.title(),
            message = self.message,
        )
    }
}
