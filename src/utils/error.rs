//! Error types for the raidcrawl crawler
//!
//! This module defines the domain error types used throughout the application.

use thiserror::Error;

/// Errors that can occur while talking to the report API
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Response body could not be read
    #[error("Failed to read response body: {0}")]
    Body(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Structural problems that make a report unusable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// Report has no entries at all
    #[error("report {instance_id} has no entries")]
    NoEntries { instance_id: i64 },

    /// Declared player count does not match the number of entries
    #[error("report {instance_id} has {actual} entries but declares {expected}")]
    EntryCountMismatch {
        instance_id: i64,
        expected: i64,
        actual: usize,
    },

    /// Every participant shows a zero activity duration
    #[error("report {instance_id} has no participant with a non-zero duration")]
    NoDuration { instance_id: i64 },

    /// Period timestamp could not be parsed
    #[error("report {instance_id} has an invalid period: {period}")]
    InvalidPeriod { instance_id: i64, period: String },
}

/// Errors raised by the primary store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Activity definition hash has no known internal id
    #[error("unknown activity definition hash {0}")]
    UnknownDefinition(u32),

    /// PostgreSQL error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Connection pool error
    #[error("Pool error: {0}")]
    Pool(String),

    /// Raw payload encoding error
    #[error("Encoding error: {0}")]
    Encode(String),
}

impl StoreError {
    /// Whether the error is a serialization conflict worth replaying
    pub fn is_serialization_failure(&self) -> bool {
        use tokio_postgres::error::SqlState;

        match self {
            Self::Database(e) => e.code().is_some_and(|code| {
                *code == SqlState::T_R_SERIALIZATION_FAILURE
                    || *code == SqlState::T_R_DEADLOCK_DETECTED
            }),
            _ => false,
        }
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

/// Errors raised by the message broker
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connection pool error
    #[error("Pool error: {0}")]
    Pool(String),

    /// Message could not be encoded or decoded
    #[error("Message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Queue has been closed
    #[error("Queue closed")]
    Closed,
}

impl From<deadpool_redis::PoolError> for QueueError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

/// Errors raised by the analytical sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Sink rejected the insert
    #[error("Insert rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Row encoding error
    #[error("Row encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
