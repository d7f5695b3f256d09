use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker carried by a cancellation describing how it should be surfaced.
///
/// `revert` restores the snapshot taken before the fetch started instead of
/// recording an error; `silent` suppresses the error dispatch entirely (used
/// when an in-flight fetch is replaced by a new one).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledError {
    /// Restore the pre-fetch state snapshot.
    pub revert: bool,
    /// Do not record the cancellation as an error.
    pub silent: bool,
}

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cancelled")
    }
}

/// Errors produced by queries and mutations.
///
/// `Fetch` wraps failures from caller-supplied functions; the other variants
/// are control flow (`Cancelled`) or misuse (`Configuration`,
/// `UndefinedData`) raised by the cache itself.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum QueryError {
    /// The caller-supplied query or mutation function failed.
    #[error("{0}")]
    Fetch(String),

    /// The operation was cancelled. Internal control flow, not a user error.
    #[error("operation cancelled")]
    Cancelled(CancelledError),

    /// The query function completed without producing a value.
    #[error("query data cannot be undefined: {query_hash}")]
    UndefinedData {
        /// Hash of the offending query.
        query_hash: String,
    },

    /// The cache was driven with missing or malformed configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Placeholder substituted for a redacted error during dehydration.
    #[error("redacted")]
    Redacted,
}

impl QueryError {
    /// Convenience constructor for user fetch errors.
    pub fn fetch(message: impl Into<String>) -> Self {
        QueryError::Fetch(message.into())
    }

    /// Whether this error is a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }

    pub(crate) fn as_cancelled(&self) -> Option<&CancelledError> {
        match self {
            QueryError::Cancelled(cancelled) => Some(cancelled),
            _ => None,
        }
    }
}
