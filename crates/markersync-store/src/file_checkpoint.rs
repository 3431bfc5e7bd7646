//! File-based checkpoint store.
//!
//! One JSON file per `(processor, partition)`, named
//! `{processor}-{partition}.json`. Writes go to a `.tmp` sibling first and
//! are then renamed into place, so a crash never leaves a torn checkpoint.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use markersync_core::{Checkpoint, CheckpointStore, PartitionId, Result, StoreError};

pub struct FileCheckpointStore {
    directory: PathBuf,
    closed: AtomicBool,
}

impl FileCheckpointStore {
    /// The directory is created by `ensure_exists`, not here.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    fn checkpoint_path(&self, processor: &str, partition: PartitionId) -> PathBuf {
        self.directory.join(format!("{processor}-{partition}.json"))
    }

    fn tmp_path(&self, processor: &str, partition: PartitionId) -> PathBuf {
        self.directory
            .join(format!("{processor}-{partition}.json.tmp"))
    }

    fn check(&self, processor: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let valid = !processor.is_empty()
            && processor
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(StoreError::InvalidArgument(format!(
                "processor name '{processor}' cannot be used as a file name"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn ensure_exists(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        tokio::fs::create_dir_all(&self.directory).await.map_err(|e| {
            StoreError::Unavailable(format!(
                "failed to create checkpoint directory {}: {e}",
                self.directory.display()
            ))
        })
    }

    async fn load(&self, processor: &str, partition: PartitionId) -> Result<Option<Checkpoint>> {
        self.check(processor)?;
        let path = self.checkpoint_path(processor, partition);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&data).map_err(|e| {
            StoreError::Malformed(format!("checkpoint file {}: {e}", path.display()))
        })?;
        Ok(Some(checkpoint))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.check(&checkpoint.processor)?;
        let data = serde_json::to_vec_pretty(checkpoint)?;

        let tmp = self.tmp_path(&checkpoint.processor, checkpoint.partition);
        let final_path = self.checkpoint_path(&checkpoint.processor, checkpoint.partition);

        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &final_path).await?;

        debug!(
            processor = %checkpoint.processor,
            partition = checkpoint.partition,
            position = %checkpoint.position,
            "checkpoint saved"
        );
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
