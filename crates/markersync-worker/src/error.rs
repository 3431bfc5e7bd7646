//! Error types for the markersync worker

use std::time::Duration;
use thiserror::Error;

use markersync_core::{PartitionId, StoreError};

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Synchronizer already started")]
    AlreadyStarted,

    #[error("Synchronizer not started")]
    NotStarted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Partition {partition} failed: {reason}")]
    PartitionFailed {
        partition: PartitionId,
        reason: String,
    },

    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
