//! Marker projection.
//!
//! [`project`] maps one change event to the marker write it implies. It has
//! no side effects; [`Projector::apply`] performs the write.
//!
//! Markers are upserted, never inserted: replaying an event (redelivery
//! after a crash, a re-poll after a failed batch) rewrites the same
//! document, so the index converges regardless of how often it is applied.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use markersync_core::{
    retry_with_backoff, ChangeEvent, ChangeKind, IndexDocument, IndexStore, Marker, Result,
    RetryPolicy, Shutdown,
};

/// Why an event produced no write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Record has no usable group key
    NoGroupKey,
    /// Document failed to decode
    Malformed(String),
    /// Deletion; orphaned markers are removed by the sweeper
    Deleted,
}

impl SkipReason {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NoGroupKey => "no_group_key",
            SkipReason::Malformed(_) => "malformed",
            SkipReason::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoGroupKey => write!(f, "record has no group key"),
            SkipReason::Malformed(e) => write!(f, "malformed document: {}", e),
            SkipReason::Deleted => write!(f, "delete event"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Upsert(Marker),
    Skip(SkipReason),
}

/// Project an event, stamping the marker with the current time.
pub fn project(event: &ChangeEvent) -> Projection {
    project_at(event, Utc::now())
}

/// Project an event with an explicit timestamp.
pub fn project_at(event: &ChangeEvent, now: DateTime<Utc>) -> Projection {
    if event.kind == ChangeKind::Delete {
        return Projection::Skip(SkipReason::Deleted);
    }

    let record = match event.decode() {
        Ok(record) => record,
        Err(e) => return Projection::Skip(SkipReason::Malformed(e.to_string())),
    };

    match record.group_key() {
        Some(group_key) => {
            let mut marker = Marker::new(group_key, event.position);
            marker.updated_at = now;
            Projection::Upsert(marker)
        }
        None => Projection::Skip(SkipReason::NoGroupKey),
    }
}

/// Writes projected markers to the index store.
#[derive(Clone)]
pub struct Projector {
    index: Arc<dyn IndexStore>,
    retry: RetryPolicy,
    shutdown: Shutdown,
}

impl Projector {
    pub fn new(index: Arc<dyn IndexStore>, retry: RetryPolicy, shutdown: Shutdown) -> Self {
        Self {
            index,
            retry,
            shutdown,
        }
    }

    /// Upsert the marker keyed by `(marker id, group key)`.
    ///
    /// Errors are returned once the retry budget is spent; the caller must
    /// not advance its checkpoint past the event.
    pub async fn apply(&self, marker: &Marker) -> Result<()> {
        let document = IndexDocument::GroupIndexMarker(marker.clone());
        retry_with_backoff(&self.retry, &self.shutdown, "upsert_marker", || {
            self.index.upsert(&marker.group_key, &document)
        })
        .await?;

        debug!(
            group_key = %marker.group_key,
            marker_id = %marker.id,
            source_position = %marker.source_position,
            "Marker upserted"
        );
        Ok(())
    }
}
