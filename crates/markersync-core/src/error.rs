//! Store Error Types
//!
//! Every backend (memory, SQLite, file checkpoints) reports failures through
//! [`StoreError`]. The variants encode how the synchronizer reacts:
//!
//! - `Transient`: throttling or a busy backend. Retried by
//!   [`retry_with_backoff`](crate::retry::retry_with_backoff), honouring an
//!   optional server-provided `retry_after` hint.
//! - `Unavailable`: the backend cannot be reached. Not retried; fatal for a
//!   feed partition and for `start()`.
//! - `Malformed`: a document or change event failed explicit decoding.
//!   Callers log and skip it.
//! - `Backend`: any other backend failure, carrying the backend's own code.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Transient error during {operation}: {message}")]
    Transient {
        operation: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend error [{code}]: {message}")]
    Backend { code: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store closed")]
    Closed,
}

impl StoreError {
    /// Shorthand for a throttling-style error without a retry hint.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Transient {
            operation: operation.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether the retry policy may try the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transient { .. } => true,
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            StoreError::Unavailable(_)
            | StoreError::Malformed(_)
            | StoreError::InvalidArgument(_)
            | StoreError::Backend { .. }
            | StoreError::Serialization(_)
            | StoreError::Closed => false,
        }
    }

    /// Server-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Stable short code used as a log field and metric label.
    pub fn code(&self) -> &str {
        match self {
            StoreError::Transient { .. } => "transient",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Malformed(_) => "malformed",
            StoreError::InvalidArgument(_) => "invalid_argument",
            StoreError::Backend { code, .. } => code,
            StoreError::Serialization(_) => "serialization",
            StoreError::Io(_) => "io",
            StoreError::Closed => "closed",
        }
    }
}
