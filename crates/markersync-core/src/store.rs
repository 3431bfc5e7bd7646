//! Store traits consumed by the synchronizer.
//!
//! The synchronizer never talks to a concrete database. It sees three narrow
//! interfaces, each implemented by the backends in `markersync-store`:
//!
//! - [`PrimaryStore`]: existence probes and the ordered change feed
//! - [`IndexStore`]: upsert / query / delete of index documents
//! - [`CheckpointStore`]: per-partition feed progress
//!
//! All implementations must be `Send + Sync` so they can be shared across
//! tasks as `Arc<dyn …>`. Per-key upsert and delete are assumed atomic; the
//! synchronizer takes no locks of its own.

use async_trait::async_trait;

use crate::document::{IndexDocument, IndexRow, MARKER_KIND};
use crate::error::Result;
use crate::types::{Checkpoint, FeedBatch, FeedPosition, PartitionId};

/// Filter applied to index queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexFilter {
    All,
    KindEquals(String),
    KindNotEquals(String),
}

impl IndexFilter {
    /// Group markers only.
    pub fn markers() -> Self {
        IndexFilter::KindEquals(MARKER_KIND.to_string())
    }

    /// Everything except group markers.
    pub fn dependents() -> Self {
        IndexFilter::KindNotEquals(MARKER_KIND.to_string())
    }

    pub fn matches(&self, kind: &str) -> bool {
        match self {
            IndexFilter::All => true,
            IndexFilter::KindEquals(k) => kind == k,
            IndexFilter::KindNotEquals(k) => kind != k,
        }
    }
}

/// Opaque key-based cursor: the `(partition_key, id)` of the last row
/// returned. Resuming after it stays correct when earlier rows are deleted
/// between pages.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Continuation {
    pub partition_key: String,
    pub id: String,
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continuation: Option<Continuation>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            continuation: None,
        }
    }

    pub fn has_more(&self) -> bool {
        self.continuation.is_some()
    }
}

/// Result of a delete: a missing document is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Create the primary container if missing. Idempotent.
    async fn ensure_exists(&self) -> Result<()>;

    /// Partitions of the change feed.
    async fn partitions(&self) -> Result<Vec<PartitionId>>;

    /// Whether at least one record with this group key exists.
    ///
    /// Must short-circuit on the first match instead of scanning the group.
    async fn exists_any(&self, group_key: &str) -> Result<bool>;

    /// Read up to `max_items` changes strictly after `since`, in commit order.
    async fn read_feed(
        &self,
        partition: PartitionId,
        since: FeedPosition,
        max_items: usize,
    ) -> Result<FeedBatch>;

    /// Release connections. Further calls may fail with `StoreError::Closed`.
    async fn close(&self) {}
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn ensure_exists(&self) -> Result<()>;

    /// Insert or replace the document with the same id in `partition_key`.
    async fn upsert(&self, partition_key: &str, document: &IndexDocument) -> Result<()>;

    /// Page through documents matching `filter`, optionally confined to one
    /// partition, resuming after `continuation`.
    async fn query(
        &self,
        filter: &IndexFilter,
        partition_key: Option<&str>,
        continuation: Option<&Continuation>,
        page_size: usize,
    ) -> Result<Page<IndexRow>>;

    async fn delete(&self, id: &str, partition_key: &str) -> Result<DeleteOutcome>;

    async fn close(&self) {}
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn ensure_exists(&self) -> Result<()>;

    /// Last saved checkpoint of `processor` on `partition`, if any.
    async fn load(&self, processor: &str, partition: PartitionId) -> Result<Option<Checkpoint>>;

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn close(&self) {}
}
