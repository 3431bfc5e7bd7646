//! Index-store documents.
//!
//! The index store holds two families of documents, told apart by their
//! `kind` field:
//!
//! - exactly one [`Marker`] per group (`kind = "groupIndex"`), and
//! - any number of [`DependentRecord`]s scoped to the group.
//!
//! Documents are decoded explicitly through [`IndexDocument::decode`]. A
//! missing `id`, `groupKey` or `kind`, or a marker with unexpected fields,
//! is reported as [`StoreError::Malformed`] rather than coerced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::types::{FeedPosition, GROUP_KEY_FIELD};

/// `kind` discriminator of group markers.
pub const MARKER_KIND: &str = "groupIndex";

/// Deterministic marker id for a group.
pub fn marker_id(group_key: &str) -> String {
    format!("marker-{}", group_key)
}

/// Singleton record stating "this group has at least one live member".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Marker {
    pub id: String,
    pub group_key: String,
    pub updated_at: DateTime<Utc>,
    /// Feed position of the change that last refreshed the marker.
    pub source_position: FeedPosition,
    /// Time-to-live in seconds, `-1` for never.
    pub ttl: i64,
}

impl Marker {
    pub fn new(group_key: impl Into<String>, source_position: FeedPosition) -> Self {
        let group_key = group_key.into();
        Self {
            id: marker_id(&group_key),
            group_key,
            updated_at: Utc::now(),
            source_position,
            ttl: -1,
        }
    }
}

/// Any non-marker index record scoped to a group.
#[derive(Debug, Clone, PartialEq)]
pub struct DependentRecord {
    pub id: String,
    pub group_key: String,
    pub kind: String,
    pub fields: Map<String, Value>,
}

impl DependentRecord {
    pub fn new(
        id: impl Into<String>,
        group_key: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            group_key: group_key.into(),
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexDocument {
    GroupIndexMarker(Marker),
    Dependent(DependentRecord),
}

impl IndexDocument {
    pub fn id(&self) -> &str {
        match self {
            IndexDocument::GroupIndexMarker(m) => &m.id,
            IndexDocument::Dependent(d) => &d.id,
        }
    }

    /// Group key, which is also the document's partition key.
    pub fn group_key(&self) -> &str {
        match self {
            IndexDocument::GroupIndexMarker(m) => &m.group_key,
            IndexDocument::Dependent(d) => &d.group_key,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            IndexDocument::GroupIndexMarker(_) => MARKER_KIND,
            IndexDocument::Dependent(d) => &d.kind,
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, IndexDocument::GroupIndexMarker(_))
    }

    pub fn as_marker(&self) -> Option<&Marker> {
        match self {
            IndexDocument::GroupIndexMarker(m) => Some(m),
            IndexDocument::Dependent(_) => None,
        }
    }

    /// Serialize to the stored JSON shape, `kind` included.
    pub fn encode(&self) -> Result<Value> {
        match self {
            IndexDocument::GroupIndexMarker(marker) => {
                let mut value = serde_json::to_value(marker)?;
                if let Value::Object(map) = &mut value {
                    map.insert("kind".to_string(), Value::String(MARKER_KIND.to_string()));
                }
                Ok(value)
            }
            IndexDocument::Dependent(record) => {
                let mut map = record.fields.clone();
                map.insert("id".to_string(), Value::String(record.id.clone()));
                map.insert(
                    GROUP_KEY_FIELD.to_string(),
                    Value::String(record.group_key.clone()),
                );
                map.insert("kind".to_string(), Value::String(record.kind.clone()));
                Ok(Value::Object(map))
            }
        }
    }

    pub fn decode(document: Value) -> Result<Self> {
        let Value::Object(mut map) = document else {
            return Err(StoreError::Malformed(
                "index document is not a JSON object".to_string(),
            ));
        };

        let kind = take_string(&mut map, "kind")?;

        if kind == MARKER_KIND {
            let marker: Marker = serde_json::from_value(Value::Object(map))
                .map_err(|e| StoreError::Malformed(format!("invalid marker: {}", e)))?;
            if marker.group_key.is_empty() {
                return Err(StoreError::Malformed("marker has empty groupKey".to_string()));
            }
            if marker.id != marker_id(&marker.group_key) {
                return Err(StoreError::Malformed(format!(
                    "marker id '{}' does not match group '{}'",
                    marker.id, marker.group_key
                )));
            }
            return Ok(IndexDocument::GroupIndexMarker(marker));
        }

        let id = take_string(&mut map, "id")?;
        let group_key = take_string(&mut map, GROUP_KEY_FIELD)?;
        Ok(IndexDocument::Dependent(DependentRecord {
            id,
            group_key,
            kind,
            fields: map,
        }))
    }
}

fn take_string(map: &mut Map<String, Value>, field: &str) -> Result<String> {
    match map.remove(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(StoreError::Malformed(format!("empty '{}'", field))),
        Some(other) => Err(StoreError::Malformed(format!(
            "'{}' is not a string: {}",
            field, other
        ))),
        None => Err(StoreError::Malformed(format!("missing '{}'", field))),
    }
}

/// A raw row returned by an index query.
///
/// Rows are decoded by the caller so that a single corrupt document can be
/// skipped without failing the page it came in.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub id: String,
    pub partition_key: String,
    pub document: Value,
}

impl IndexRow {
    pub fn decode(&self) -> Result<IndexDocument> {
        IndexDocument::decode(self.document.clone())
    }
}
