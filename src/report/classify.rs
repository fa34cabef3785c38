//! Outcome classification
//!
//! Pure mapping from an HTTP status and body to one of a fixed set of named
//! outcomes. Nothing here touches the network or the store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Envelope, RawReport};

/// Platform error code for an instance id that does not exist (yet)
pub const ERROR_CODE_NOT_FOUND: i32 = 1653;

/// Platform error code for a disabled system
pub const ERROR_CODE_SYSTEM_DISABLED: i32 = 5;

/// Platform error code for a report hidden from the caller
pub const ERROR_CODE_INSUFFICIENT_PRIVILEGES: i32 = 12;

/// Result of one attempt at one instance id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Report decoded, matched the tracked mode and was stored
    Success,
    /// Report was already stored by an earlier attempt
    Duplicate,
    /// Report exists but belongs to another activity mode
    NotMatchingType,
    /// Instance id not assigned yet
    NotFound,
    /// Upstream has switched the endpoint off
    UpstreamDisabled,
    /// Report is redacted for this caller
    AccessRestricted,
    /// Body could not be decoded or failed structural validation
    Malformed,
    /// Any other upstream or transport failure
    Transient,
    /// Report was readable but the store cannot hold it (unknown definition);
    /// never produced by [`classify`]
    Unwritable,
}

impl Outcome {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Duplicate => "duplicate",
            Self::NotMatchingType => "not_matching_type",
            Self::NotFound => "not_found",
            Self::UpstreamDisabled => "upstream_disabled",
            Self::AccessRestricted => "access_restricted",
            Self::Malformed => "malformed",
            Self::Transient => "transient",
            Self::Unwritable => "unwritable",
        }
    }

    /// Whether the id is settled and needs no further attempts
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Success | Self::Duplicate | Self::NotMatchingType)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded report together with its original JSON payload
#[derive(Debug, Clone)]
pub struct FetchedReport {
    pub report: RawReport,
    /// The `Response` object as received, kept for the raw payload table
    pub payload: serde_json::Value,
}

/// Classifier output
#[derive(Debug, Clone)]
pub struct Classification {
    pub outcome: Outcome,

    /// Present for `Success` and `NotMatchingType`
    pub report: Option<FetchedReport>,

    /// Global pause demanded by the upstream
    pub throttle: Option<Duration>,

    /// Platform error code, when the body carried one
    pub error_code: Option<i32>,

    /// Why a body was rejected
    pub detail: Option<String>,
}

impl Classification {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            report: None,
            throttle: None,
            error_code: None,
            detail: None,
        }
    }

    fn malformed(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(Outcome::Malformed)
        }
    }

    /// Classification for a request that never produced a response
    pub fn transport_failure(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(Outcome::Transient)
        }
    }
}

/// Classify one response
///
/// `tracked_mode` is the activity mode that gets stored; every other mode is
/// `NotMatchingType`.
pub fn classify(status: u16, body: &[u8], tracked_mode: i32) -> Classification {
    let envelope: Envelope<serde_json::Value> = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Classification::malformed(format!("undecodable body (HTTP {status}): {e}"))
        }
    };

    let throttle = (envelope.throttle_seconds > 0)
        .then(|| Duration::from_secs(envelope.throttle_seconds as u64));

    let mut classification = if status == 200 {
        classify_success(envelope.response, tracked_mode)
    } else {
        let outcome = match envelope.error_code {
            ERROR_CODE_NOT_FOUND => Outcome::NotFound,
            ERROR_CODE_SYSTEM_DISABLED => Outcome::UpstreamDisabled,
            ERROR_CODE_INSUFFICIENT_PRIVILEGES => Outcome::AccessRestricted,
            _ => Outcome::Transient,
        };
        Classification {
            detail: Some(format!(
                "HTTP {status} {}: {}",
                envelope.error_status, envelope.message
            )),
            ..Classification::new(outcome)
        }
    };

    classification.throttle = throttle;
    if envelope.error_code != 0 {
        classification.error_code = Some(envelope.error_code);
    }
    classification
}

fn classify_success(response: Option<serde_json::Value>, tracked_mode: i32) -> Classification {
    let Some(payload) = response else {
        return Classification::malformed("success envelope without a Response");
    };

    let report: RawReport = match serde_json::from_value(payload.clone()) {
        Ok(report) => report,
        Err(e) => return Classification::malformed(format!("undecodable report: {e}")),
    };

    let outcome = if report.activity_details.mode != tracked_mode {
        Outcome::NotMatchingType
    } else if let Err(e) = report.validate() {
        return Classification::malformed(e.to_string());
    } else {
        Outcome::Success
    };

    Classification {
        report: Some(FetchedReport { report, payload }),
        ..Classification::new(outcome)
    }
}
