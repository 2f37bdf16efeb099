//! Error taxonomy for the alert automation pipeline.
//!
//! Each stage surfaces its own error type so callers can tell a dropped
//! reading apart from a rejected rule definition or an unavailable store.

use crate::models::MetricType;

/// A reading that cannot be evaluated. The reading is dropped and logged;
/// ingestion of later readings continues.
#[derive(Debug, thiserror::Error)]
pub enum InvalidReadingError {
    #[error("unknown metric type '{0}'")]
    UnknownMetric(String),

    #[error("{metric} value is not a finite number")]
    NonFinite { metric: MetricType },

    #[error("{metric} value {value} is outside the accepted range [{min}, {max}]")]
    OutOfRange {
        metric: MetricType,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("coordinates ({latitude}, {longitude}) are out of range")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
}

/// Storage was unreachable, too slow, or returned data that could not be read.
///
/// Never retried internally; the caller decides whether to try again.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to rule administrators.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule: {0}")]
    Validation(String),

    #[error("rule conflicts with active rule {existing_id}: {reason}")]
    ConfigurationConflict { existing_id: i64, reason: String },

    #[error("rule {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors returned by the non-blocking ingest path.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] InvalidReadingError),

    #[error("ingest queue is full")]
    QueueFull,

    #[error("ingester is shutting down")]
    ShuttingDown,
}
