//! Change feed and primary-store types.
//!
//! Primary records are owned by an upstream write path; the synchronizer
//! only ever sees them as JSON documents inside [`ChangeEvent`]s and decodes
//! them explicitly with [`PrimaryRecord::from_document`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StoreError};

/// Change feed partition identifier.
pub type PartitionId = u32;

/// JSON field holding the group key of a primary record.
pub const GROUP_KEY_FIELD: &str = "groupKey";

/// Position within one change feed partition.
///
/// Positions increase monotonically in commit order. Feed reads are
/// exclusive: reading "since" a position returns strictly later changes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FeedPosition(pub u64);

impl FeedPosition {
    /// Position before the first change of every partition.
    pub const BEGINNING: FeedPosition = FeedPosition(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Replace,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Replace => write!(f, "replace"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for ChangeKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(ChangeKind::Create),
            "replace" => Ok(ChangeKind::Replace),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(StoreError::Malformed(format!("unknown change kind '{}'", other))),
        }
    }
}

/// A record of the primary store.
///
/// `group_key` is optional on purpose: records without one exist upstream
/// and must be skipped by the projector rather than rejected by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryRecord {
    pub id: String,
    pub group_key: Option<String>,
    pub fields: Map<String, Value>,
}

impl PrimaryRecord {
    pub fn new(id: impl Into<String>, group_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_key: Some(group_key.into()),
            fields: Map::new(),
        }
    }

    /// Record without a group key.
    pub fn ungrouped(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_key: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// The group key, if present and not blank.
    pub fn group_key(&self) -> Option<&str> {
        self.group_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// Decode a primary document.
    ///
    /// `id` must be a non-empty string. `groupKey` may be absent or null but
    /// must be a string when present. Every other field is kept verbatim.
    pub fn from_document(document: Value) -> Result<Self> {
        let Value::Object(mut fields) = document else {
            return Err(StoreError::Malformed(
                "primary document is not a JSON object".to_string(),
            ));
        };

        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::String(_)) => {
                return Err(StoreError::Malformed("primary document has empty id".to_string()))
            }
            Some(other) => {
                return Err(StoreError::Malformed(format!(
                    "primary document id is not a string: {}",
                    other
                )))
            }
            None => {
                return Err(StoreError::Malformed("primary document has no id".to_string()))
            }
        };

        let group_key = match fields.remove(GROUP_KEY_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(key)) => Some(key),
            Some(other) => {
                return Err(StoreError::Malformed(format!(
                    "record {} has non-string {}: {}",
                    id, GROUP_KEY_FIELD, other
                )))
            }
        };

        Ok(Self {
            id,
            group_key,
            fields,
        })
    }

    pub fn to_document(&self) -> Value {
        let mut doc = self.fields.clone();
        doc.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(key) = &self.group_key {
            doc.insert(GROUP_KEY_FIELD.to_string(), Value::String(key.clone()));
        }
        Value::Object(doc)
    }
}

/// One entry of the change feed.
///
/// The document is kept undecoded so that a malformed entry surfaces as a
/// per-event decode error instead of failing the whole batch read.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub partition: PartitionId,
    pub position: FeedPosition,
    pub kind: ChangeKind,
    pub document: Value,
}

impl ChangeEvent {
    pub fn from_record(
        partition: PartitionId,
        position: FeedPosition,
        kind: ChangeKind,
        record: &PrimaryRecord,
    ) -> Self {
        Self {
            partition,
            position,
            kind,
            document: record.to_document(),
        }
    }

    pub fn decode(&self) -> Result<PrimaryRecord> {
        PrimaryRecord::from_document(self.document.clone())
    }
}

/// A batch read from one feed partition, in commit order.
#[derive(Debug, Clone, Default)]
pub struct FeedBatch {
    pub events: Vec<ChangeEvent>,
}

impl FeedBatch {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self { events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Position the checkpoint advances to once the batch is applied.
    pub fn last_position(&self) -> Option<FeedPosition> {
        self.events.last().map(|e| e.position)
    }
}

/// Durable progress of one processor over one feed partition (the "lease").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub processor: String,
    pub partition: PartitionId,
    pub position: FeedPosition,
    pub owner: String,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        processor: impl Into<String>,
        partition: PartitionId,
        position: FeedPosition,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            processor: processor.into(),
            partition,
            position,
            owner: owner.into(),
            updated_at: Utc::now(),
        }
    }
}
