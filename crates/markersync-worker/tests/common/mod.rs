//! Shared helpers for synchronizer integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use markersync_core::{
    Continuation, DeleteOutcome, FeedBatch, FeedPosition, IndexDocument, IndexFilter, IndexRow,
    IndexStore, Page, PartitionId, PrimaryStore, Result, StoreError,
};
use markersync_store::MemoryStore;
use markersync_worker::SyncConfig;

/// Config with short intervals so tests finish quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        instance_name: "test-instance".to_string(),
        feed_partitions: 1,
        feed_max_batch_size: 10,
        feed_poll_interval: Duration::from_millis(5),
        sweep_interval: Duration::from_secs(3600),
        sweep_page_size: 2,
        max_retries: 0,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        max_consecutive_batch_failures: 1000,
        shutdown_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    }
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Index store whose upserts fail with a transient error until healed.
pub struct FlakyIndex {
    pub inner: Arc<MemoryStore>,
    pub healed: AtomicBool,
    pub failed_upserts: AtomicUsize,
    /// Upserts that succeed before the failures start.
    pub passing: AtomicUsize,
}

impl FlakyIndex {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self::failing_after(inner, 0)
    }

    pub fn failing_after(inner: Arc<MemoryStore>, passing: usize) -> Self {
        Self {
            inner,
            healed: AtomicBool::new(false),
            failed_upserts: AtomicUsize::new(0),
            passing: AtomicUsize::new(passing),
        }
    }

    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    pub fn failures(&self) -> usize {
        self.failed_upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexStore for FlakyIndex {
    async fn ensure_exists(&self) -> Result<()> {
        IndexStore::ensure_exists(self.inner.as_ref()).await
    }

    async fn upsert(&self, partition_key: &str, document: &IndexDocument) -> Result<()> {
        let passed = self
            .passing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !passed && !self.healed.load(Ordering::SeqCst) {
            self.failed_upserts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Transient {
                operation: "upsert".to_string(),
                message: "429 request rate too large".to_string(),
                retry_after: Some(Duration::from_millis(1)),
            });
        }
        self.inner.upsert(partition_key, document).await
    }

    async fn query(
        &self,
        filter: &IndexFilter,
        partition_key: Option<&str>,
        continuation: Option<&Continuation>,
        page_size: usize,
    ) -> Result<Page<IndexRow>> {
        self.inner
            .query(filter, partition_key, continuation, page_size)
            .await
    }

    async fn delete(&self, id: &str, partition_key: &str) -> Result<DeleteOutcome> {
        self.inner.delete(id, partition_key).await
    }

    async fn close(&self) {
        IndexStore::close(self.inner.as_ref()).await;
    }
}

/// Index store whose upserts take far longer than any test timeout.
pub struct SlowIndex {
    pub inner: Arc<MemoryStore>,
    pub entered: AtomicBool,
    pub delay: Duration,
}

#[async_trait]
impl IndexStore for SlowIndex {
    async fn ensure_exists(&self) -> Result<()> {
        IndexStore::ensure_exists(self.inner.as_ref()).await
    }

    async fn upsert(&self, partition_key: &str, document: &IndexDocument) -> Result<()> {
        self.entered.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(partition_key, document).await
    }

    async fn query(
        &self,
        filter: &IndexFilter,
        partition_key: Option<&str>,
        continuation: Option<&Continuation>,
        page_size: usize,
    ) -> Result<Page<IndexRow>> {
        self.inner
            .query(filter, partition_key, continuation, page_size)
            .await
    }

    async fn delete(&self, id: &str, partition_key: &str) -> Result<DeleteOutcome> {
        self.inner.delete(id, partition_key).await
    }

    async fn close(&self) {
        IndexStore::close(self.inner.as_ref()).await;
    }
}

/// Primary store whose feed is unreachable on one partition.
pub struct BrokenPartition {
    pub inner: Arc<MemoryStore>,
    pub broken: PartitionId,
}

#[async_trait]
impl PrimaryStore for BrokenPartition {
    async fn ensure_exists(&self) -> Result<()> {
        PrimaryStore::ensure_exists(self.inner.as_ref()).await
    }

    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        self.inner.partitions().await
    }

    async fn exists_any(&self, group_key: &str) -> Result<bool> {
        self.inner.exists_any(group_key).await
    }

    async fn read_feed(
        &self,
        partition: PartitionId,
        since: FeedPosition,
        max_items: usize,
    ) -> Result<FeedBatch> {
        if partition == self.broken {
            return Err(StoreError::Unavailable(format!(
                "partition {} lease lost",
                partition
            )));
        }
        self.inner.read_feed(partition, since, max_items).await
    }

    async fn close(&self) {
        PrimaryStore::close(self.inner.as_ref()).await;
    }
}
