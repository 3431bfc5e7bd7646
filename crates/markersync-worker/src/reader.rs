//! Change feed reader.
//!
//! One [`PartitionReader`] runs per feed partition as its own task:
//!
//! ```text
//! load checkpoint
//!   └─→ poll(since = checkpoint)
//!         ├─ empty   → sleep poll_interval → poll
//!         └─ batch   → project + upsert each event in order
//!                        ├─ ok   → save checkpoint(last position) → poll
//!                        └─ err  → backoff → poll again from checkpoint
//! ```
//!
//! Delivery is at-least-once: the checkpoint is saved only after every
//! event of the batch has been applied, so a crash or a failed write leads
//! to redelivery, never to a skipped event.
//!
//! A partition whose feed read exhausts its retries, that hits a
//! non-retryable error, or that fails `max_consecutive_batch_failures`
//! batches in a row stops with [`PartitionStatus::Failed`]. Other partitions
//! and the sweeper are unaffected.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use markersync_core::{
    retry_with_backoff, Checkpoint, CheckpointStore, FeedBatch, FeedPosition, PartitionId,
    PrimaryStore, RetryPolicy, Shutdown, StoreError,
};

use crate::metrics;
use crate::projector::{project, Projection, Projector, SkipReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionStatus {
    Running,
    Stopped,
    Failed(String),
}

impl PartitionStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, PartitionStatus::Failed(_))
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStatus::Running => write!(f, "RUNNING"),
            PartitionStatus::Stopped => write!(f, "STOPPED"),
            PartitionStatus::Failed(reason) => write!(f, "FAILED: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub processor_name: String,
    pub owner: String,
    pub max_batch_size: usize,
    pub poll_interval: Duration,
    pub max_consecutive_batch_failures: u32,
    pub retry: RetryPolicy,
}

pub struct PartitionReader {
    partition: PartitionId,
    primary: Arc<dyn PrimaryStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    projector: Projector,
    config: ReaderConfig,
    shutdown: Shutdown,
    status: watch::Sender<PartitionStatus>,
}

impl PartitionReader {
    pub fn new(
        partition: PartitionId,
        primary: Arc<dyn PrimaryStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        projector: Projector,
        config: ReaderConfig,
        shutdown: Shutdown,
    ) -> Self {
        let (status, _) = watch::channel(PartitionStatus::Running);
        Self {
            partition,
            primary,
            checkpoints,
            projector,
            config,
            shutdown,
            status,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Live status of this reader.
    pub fn status(&self) -> watch::Receiver<PartitionStatus> {
        self.status.subscribe()
    }

    /// Run until shutdown or a fatal error. Returns the final status.
    pub async fn run(self) -> PartitionStatus {
        let final_status = self.consume().await;
        match &final_status {
            PartitionStatus::Failed(reason) => error!(
                partition = self.partition,
                reason = %reason,
                "Partition reader failed"
            ),
            _ => info!(partition = self.partition, "Partition reader stopped"),
        }
        self.status.send_replace(final_status.clone());
        final_status
    }

    async fn consume(&self) -> PartitionStatus {
        let mut position = match self.load_checkpoint().await {
            Ok(position) => position,
            Err(e) => return self.failed_or_stopped("load_checkpoint", e),
        };

        info!(
            partition = self.partition,
            processor = %self.config.processor_name,
            position = %position,
            "Partition reader started"
        );

        let mut consecutive_failures: u32 = 0;

        loop {
            if self.shutdown.is_shutdown() {
                return PartitionStatus::Stopped;
            }

            let batch = match self.poll(position).await {
                None => return PartitionStatus::Stopped,
                Some(Ok(batch)) => batch,
                Some(Err(e)) => return self.failed_or_stopped("read_feed", e),
            };

            if batch.is_empty() {
                if !self.shutdown.sleep(self.config.poll_interval).await {
                    return PartitionStatus::Stopped;
                }
                continue;
            }

            match self.apply_batch(&batch).await {
                Ok(last) => {
                    position = last;
                    consecutive_failures = 0;
                }
                Err(e) => {
                    if self.shutdown.is_shutdown() {
                        return PartitionStatus::Stopped;
                    }
                    metrics::BATCHES_FAILED_TOTAL
                        .with_label_values(&[&self.partition.to_string()])
                        .inc();
                    if !e.is_retryable() {
                        return PartitionStatus::Failed(format!("apply batch: {}", e));
                    }

                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_consecutive_batch_failures {
                        return PartitionStatus::Failed(format!(
                            "{} consecutive batch failures, last: {}",
                            consecutive_failures, e
                        ));
                    }

                    let delay = self
                        .config
                        .retry
                        .backoff(consecutive_failures as usize - 1);
                    warn!(
                        partition = self.partition,
                        checkpoint = %position,
                        consecutive_failures,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch apply failed, redelivering from checkpoint"
                    );
                    if !self.shutdown.sleep(delay).await {
                        return PartitionStatus::Stopped;
                    }
                }
            }
        }
    }

    fn failed_or_stopped(&self, operation: &str, err: StoreError) -> PartitionStatus {
        if self.shutdown.is_shutdown() {
            PartitionStatus::Stopped
        } else {
            PartitionStatus::Failed(format!("{}: {}", operation, err))
        }
    }

    async fn load_checkpoint(&self) -> Result<FeedPosition, StoreError> {
        let checkpoint = retry_with_backoff(
            &self.config.retry,
            &self.shutdown,
            "load_checkpoint",
            || {
                self.checkpoints
                    .load(&self.config.processor_name, self.partition)
            },
        )
        .await?;
        Ok(checkpoint
            .map(|c| c.position)
            .unwrap_or(FeedPosition::BEGINNING))
    }

    /// Read the next batch. `None` when shutdown interrupted the read.
    async fn poll(&self, since: FeedPosition) -> Option<Result<FeedBatch, StoreError>> {
        self.shutdown
            .guard(retry_with_backoff(
                &self.config.retry,
                &self.shutdown,
                "read_feed",
                || {
                    self.primary
                        .read_feed(self.partition, since, self.config.max_batch_size)
                },
            ))
            .await
    }

    /// Apply every event in order, then checkpoint the last position.
    async fn apply_batch(&self, batch: &FeedBatch) -> Result<FeedPosition, StoreError> {
        let partition_label = self.partition.to_string();

        for event in &batch.events {
            match project(event) {
                Projection::Upsert(marker) => {
                    self.projector.apply(&marker).await?;
                    metrics::EVENTS_PROJECTED_TOTAL
                        .with_label_values(&[&partition_label])
                        .inc();
                }
                Projection::Skip(reason) => {
                    match &reason {
                        SkipReason::Deleted => debug!(
                            partition = self.partition,
                            position = %event.position,
                            "Skipping delete event"
                        ),
                        _ => warn!(
                            partition = self.partition,
                            position = %event.position,
                            reason = %reason,
                            "Skipping change event"
                        ),
                    }
                    metrics::EVENTS_SKIPPED_TOTAL
                        .with_label_values(&[&partition_label, reason.label()])
                        .inc();
                }
            }
        }

        let Some(last) = batch.last_position() else {
            return Err(StoreError::InvalidArgument("empty batch".to_string()));
        };

        let checkpoint = Checkpoint::new(
            self.config.processor_name.clone(),
            self.partition,
            last,
            self.config.owner.clone(),
        );
        retry_with_backoff(&self.config.retry, &self.shutdown, "save_checkpoint", || {
            self.checkpoints.save(&checkpoint)
        })
        .await?;

        metrics::CHECKPOINT_POSITION
            .with_label_values(&[&partition_label])
            .set(last.value() as i64);
        debug!(
            partition = self.partition,
            events = batch.len(),
            position = %last,
            "Batch applied, checkpoint saved"
        );
        Ok(last)
    }
}
