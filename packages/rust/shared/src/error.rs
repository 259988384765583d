//! Error types for Gleaner.
//!
//! Library crates use [`GleanerError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Variants fall into three groups:
//! - per-item failures (`TransientFetch`, `PermanentFetch`, `Extraction`) that are
//!   recorded against one URL or artifact and never abort a run
//! - scheduling/lookup outcomes (`ScheduleConflict`, `NotFound`)
//! - infrastructure failures (`ContentStore`, `Storage`) that abort the current run

use std::path::PathBuf;

/// Top-level error type for all Gleaner operations.
#[derive(Debug, thiserror::Error)]
pub enum GleanerError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network or timeout failure that is worth retrying.
    #[error("transient fetch error for {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    /// Fetch failure that will not succeed on retry (4xx, malformed URL, oversized body).
    #[error("permanent fetch error for {url}: {reason}")]
    PermanentFetch { url: String, reason: String },

    /// HTTP client construction failure.
    #[error("network error: {0}")]
    Network(String),

    /// Unsupported or corrupt content.
    #[error("extraction error: {reason}")]
    Extraction { reason: String },

    /// A crawl for this source is already in flight.
    #[error("crawl already in flight for source {source_id}")]
    ScheduleConflict { source_id: String },

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Content store unreachable or corrupt.
    #[error("content store error: {0}")]
    ContentStore(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Scoring policy failure or out-of-range score.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad schedule, bad URL, invalid state transition, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The operation was cancelled by an operator or a timeout.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, GleanerError>;

impl GleanerError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an extraction error with the given reason.
    pub fn extraction(reason: impl Into<String>) -> Self {
        Self::Extraction {
            reason: reason.into(),
        }
    }

    /// Create a not-found error for a record kind and id.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a transient fetch error.
    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a permanent fetch error.
    pub fn permanent(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermanentFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch { .. })
    }

    /// Infrastructure-availability failures that abort the current run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ContentStore(_) | Self::Storage(_))
    }
}
