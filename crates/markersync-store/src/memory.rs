//! In-memory store backend.
//!
//! [`MemoryStore`] plays all three store roles at once. The primary side
//! keeps a change log per feed partition so that reads behave like a real
//! change feed: ordered, resumable from any position, and replayable.
//!
//! Besides the trait methods it exposes the upstream write path
//! (`put_record`, `delete_record`, `delete_group`) and a few inspection
//! helpers used by tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use markersync_core::{
    ChangeEvent, ChangeKind, Checkpoint, CheckpointStore, Continuation, DeleteOutcome,
    FeedBatch, FeedPosition, IndexDocument, IndexFilter, IndexRow, IndexStore, Page,
    PartitionId, PrimaryRecord, PrimaryStore, Result, StoreError, GROUP_KEY_FIELD,
};

use crate::partition_for;

#[derive(Default)]
struct State {
    /// (group key, id) -> record. Ungrouped records use an empty key.
    primary: BTreeMap<(String, String), PrimaryRecord>,
    feed: HashMap<PartitionId, Vec<ChangeEvent>>,
    last_position: u64,
    /// (partition key, id) -> stored document
    index: BTreeMap<(String, String), Value>,
    checkpoints: HashMap<(String, PartitionId), Checkpoint>,
}

pub struct MemoryStore {
    state: RwLock<State>,
    feed_partitions: u32,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(feed_partitions: u32) -> Self {
        Self {
            state: RwLock::new(State::default()),
            feed_partitions: feed_partitions.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn append_change(state: &mut State, partition: PartitionId, kind: ChangeKind, document: Value) -> FeedPosition {
        state.last_position += 1;
        let position = FeedPosition(state.last_position);
        state.feed.entry(partition).or_default().push(ChangeEvent {
            partition,
            position,
            kind,
            document,
        });
        position
    }

    /// Create or replace a primary record and append the change to the feed.
    pub async fn put_record(&self, record: &PrimaryRecord) -> Result<FeedPosition> {
        self.check_open()?;
        let partition = partition_for(record.group_key(), self.feed_partitions);
        let key = (record.group_key().unwrap_or_default().to_string(), record.id.clone());
        let document = record.to_document();

        let mut state = self.state.write().await;
        let kind = if state.primary.insert(key, record.clone()).is_some() {
            ChangeKind::Replace
        } else {
            ChangeKind::Create
        };
        let position = Self::append_change(&mut state, partition, kind, document);
        debug!(partition, position = %position, kind = %kind, "primary record written");
        Ok(position)
    }

    /// Delete a primary record. Returns whether it existed.
    pub async fn delete_record(&self, group_key: Option<&str>, id: &str) -> Result<bool> {
        self.check_open()?;
        let key = (group_key.unwrap_or_default().to_string(), id.to_string());
        let mut state = self.state.write().await;
        if state.primary.remove(&key).is_none() {
            return Ok(false);
        }
        let partition = partition_for(group_key, self.feed_partitions);
        let mut tombstone = serde_json::Map::new();
        tombstone.insert("id".to_string(), Value::String(id.to_string()));
        if let Some(g) = group_key {
            tombstone.insert(GROUP_KEY_FIELD.to_string(), Value::String(g.to_string()));
        }
        Self::append_change(&mut state, partition, ChangeKind::Delete, Value::Object(tombstone));
        Ok(true)
    }

    /// Delete every record of a group. Returns how many were removed.
    pub async fn delete_group(&self, group_key: &str) -> Result<usize> {
        let ids: Vec<String> = {
            let state = self.state.read().await;
            state
                .primary
                .keys()
                .filter(|(g, _)| g == group_key)
                .map(|(_, id)| id.clone())
                .collect()
        };
        let mut removed = 0;
        for id in ids {
            if self.delete_record(Some(group_key), &id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Append a raw feed entry, bypassing record decoding.
    pub async fn append_raw_change(
        &self,
        partition: PartitionId,
        kind: ChangeKind,
        document: Value,
    ) -> FeedPosition {
        let mut state = self.state.write().await;
        Self::append_change(&mut state, partition, kind, document)
    }

    /// Store an index document as-is, bypassing the trait's validation.
    pub async fn insert_raw_index(&self, partition_key: &str, id: &str, document: Value) {
        let mut state = self.state.write().await;
        state
            .index
            .insert((partition_key.to_string(), id.to_string()), document);
    }

    pub async fn get_index(&self, partition_key: &str, id: &str) -> Option<IndexDocument> {
        let state = self.state.read().await;
        state
            .index
            .get(&(partition_key.to_string(), id.to_string()))
            .and_then(|doc| IndexDocument::decode(doc.clone()).ok())
    }

    /// All index documents of one partition key.
    pub async fn index_documents(&self, partition_key: &str) -> Vec<Value> {
        let state = self.state.read().await;
        state
            .index
            .iter()
            .filter(|((pk, _), _)| pk == partition_key)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    pub async fn index_len(&self) -> usize {
        self.state.read().await.index.len()
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.primary.len()
    }

    pub fn feed_partition_count(&self) -> u32 {
        self.feed_partitions
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl PrimaryStore for MemoryStore {
    async fn ensure_exists(&self) -> Result<()> {
        self.check_open()
    }

    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        self.check_open()?;
        Ok((0..self.feed_partitions).collect())
    }

    async fn exists_any(&self, group_key: &str) -> Result<bool> {
        self.check_open()?;
        if group_key.is_empty() {
            return Ok(false);
        }
        let state = self.state.read().await;
        let start = (group_key.to_string(), String::new());
        Ok(state
            .primary
            .range(start..)
            .next()
            .map(|((g, _), _)| g == group_key)
            .unwrap_or(false))
    }

    async fn read_feed(
        &self,
        partition: PartitionId,
        since: FeedPosition,
        max_items: usize,
    ) -> Result<FeedBatch> {
        self.check_open()?;
        if partition >= self.feed_partitions {
            return Err(StoreError::InvalidArgument(format!(
                "unknown feed partition {}",
                partition
            )));
        }
        let state = self.state.read().await;
        let events = state
            .feed
            .get(&partition)
            .map(|log| {
                log.iter()
                    .filter(|e| e.position > since)
                    .take(max_items)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(FeedBatch::new(events))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn ensure_exists(&self) -> Result<()> {
        self.check_open()
    }

    async fn upsert(&self, partition_key: &str, document: &IndexDocument) -> Result<()> {
        self.check_open()?;
        if document.group_key() != partition_key {
            return Err(StoreError::InvalidArgument(format!(
                "document {} belongs to group '{}', not partition '{}'",
                document.id(),
                document.group_key(),
                partition_key
            )));
        }
        let encoded = document.encode()?;
        let mut state = self.state.write().await;
        state
            .index
            .insert((partition_key.to_string(), document.id().to_string()), encoded);
        Ok(())
    }

    async fn query(
        &self,
        filter: &IndexFilter,
        partition_key: Option<&str>,
        continuation: Option<&Continuation>,
        page_size: usize,
    ) -> Result<Page<IndexRow>> {
        self.check_open()?;
        let page_size = page_size.max(1);
        let state = self.state.read().await;

        let mut items = Vec::new();
        for ((pk, id), document) in state.index.iter() {
            if let Some(after) = continuation {
                if (pk.as_str(), id.as_str()) <= (after.partition_key.as_str(), after.id.as_str()) {
                    continue;
                }
            }
            if let Some(wanted) = partition_key {
                if pk != wanted {
                    continue;
                }
            }
            let kind = document.get("kind").and_then(Value::as_str).unwrap_or_default();
            if !filter.matches(kind) {
                continue;
            }
            items.push(IndexRow {
                id: id.clone(),
                partition_key: pk.clone(),
                document: document.clone(),
            });
            if items.len() == page_size {
                break;
            }
        }

        let continuation = if items.len() == page_size {
            items.last().map(|row| Continuation {
                partition_key: row.partition_key.clone(),
                id: row.id.clone(),
            })
        } else {
            None
        };

        Ok(Page { items, continuation })
    }

    async fn delete(&self, id: &str, partition_key: &str) -> Result<DeleteOutcome> {
        self.check_open()?;
        let mut state = self.state.write().await;
        match state.index.remove(&(partition_key.to_string(), id.to_string())) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn ensure_exists(&self) -> Result<()> {
        self.check_open()
    }

    async fn load(&self, processor: &str, partition: PartitionId) -> Result<Option<Checkpoint>> {
        self.check_open()?;
        let state = self.state.read().await;
        Ok(state
            .checkpoints
            .get(&(processor.to_string(), partition))
            .cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write().await;
        state.checkpoints.insert(
            (checkpoint.processor.clone(), checkpoint.partition),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
