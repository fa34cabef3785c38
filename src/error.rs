//! Unified error handling for the raidcrawl crate
//!
//! Domain errors live in [`crate::utils::error`]. This module adds the
//! crate-level [`Error`] for configuration and fail-stop conditions, and the
//! classification the crawler uses to decide whether a failure is worth
//! another attempt.
//!
//! # Architecture
//!
//! - [`CrawlErrorTrait`] - Recoverability and category of an error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Configuration and fail-stop errors
//!
//! Remote-API outcomes (not found, disabled, restricted) are not errors; they
//! travel as [`crate::report::classify::Outcome`] values. Errors here are the
//! conditions that abort a write or the process.

use thiserror::Error;

pub use crate::utils::error::StoreError;

/// Common trait for all raidcrawl error types
pub trait CrawlErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Primary store errors
    Storage,
    /// Configuration and validation errors
    Config,
    /// Conditions that require an operator
    Fatal,
}

impl ErrorCategory {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Fatal => "fatal",
        }
    }
}

impl CrawlErrorTrait for StoreError {
    /// Connection and transaction failures may clear up on a later attempt;
    /// a report the schema cannot hold never will
    fn is_recoverable(&self) -> bool {
        match self {
            Self::UnknownDefinition(_) | Self::Encode(_) => false,
            Self::Database(_) | Self::Pool(_) => true,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Storage
    }
}

/// Unified error type for the raidcrawl crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Gap mode accumulated too many misses without recovering
    #[error("gap mode gave up after {misses} misses starting at instance {start}")]
    GapModeExhausted { start: i64, misses: u64 },
}

impl CrawlErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::GapModeExhausted { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Config,
            Self::GapModeExhausted { .. } => ErrorCategory::Fatal,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
