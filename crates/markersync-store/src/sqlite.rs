//! SQLite Store Implementation
//!
//! [`SqliteStore`] implements the primary, index and checkpoint roles on one
//! embedded SQLite database. Each logical container is a table:
//!
//! | Container          | Table                | Key                        |
//! |--------------------|----------------------|----------------------------|
//! | primary records    | `{primary}`          | `(group_key, id)`          |
//! | change feed        | `{primary}_feed`     | `position` (AUTOINCREMENT) |
//! | index documents    | `{index}`            | `(partition_key, id)`      |
//! | checkpoints        | `{leases}`           | `(processor, feed_partition)` |
//!
//! ## Change feed
//!
//! Writes through [`SqliteStore::put_record`] and
//! [`SqliteStore::delete_record`] update the primary table and append to the
//! feed log in the same transaction, so the feed never misses or reorders a
//! committed change. `AUTOINCREMENT` guarantees a position is never reused,
//! even after the highest row is removed.
//!
//! ## Queries
//!
//! Table names come from configuration and cannot be bound as parameters.
//! They are validated as plain identifiers by [`ContainerNames::validate`]
//! before any statement is built; every value is bound.
//!
//! Pagination uses a row-value cursor, `(partition_key, id) > (?, ?)`, so a
//! delete between two pages never shifts the next page.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use markersync_core::{
    ChangeEvent, ChangeKind, Checkpoint, CheckpointStore, Continuation, DeleteOutcome,
    FeedBatch, FeedPosition, IndexDocument, IndexFilter, IndexRow, IndexStore, Page,
    PartitionId, PrimaryRecord, PrimaryStore, Result, StoreError, GROUP_KEY_FIELD,
};

use crate::partition_for;

/// Table names of the three logical containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerNames {
    pub primary: String,
    pub index: String,
    pub leases: String,
}

impl Default for ContainerNames {
    fn default() -> Self {
        Self {
            primary: "group_members".to_string(),
            index: "group_index".to_string(),
            leases: "leases".to_string(),
        }
    }
}

impl ContainerNames {
    pub fn feed(&self) -> String {
        format!("{}_feed", self.primary)
    }

    /// Every name must be a plain SQL identifier and all tables distinct.
    pub fn validate(&self) -> Result<()> {
        for (role, name) in [
            ("primary", &self.primary),
            ("index", &self.index),
            ("leases", &self.leases),
        ] {
            if !is_identifier(name) {
                return Err(StoreError::InvalidArgument(format!(
                    "{} container name '{}' is not a valid identifier",
                    role, name
                )));
            }
        }

        let feed = self.feed();
        let tables = [&self.primary, &self.index, &self.leases, &feed];
        for (i, a) in tables.iter().enumerate() {
            if tables[i + 1..].iter().any(|b| a.eq_ignore_ascii_case(b)) {
                return Err(StoreError::InvalidArgument(format!(
                    "container name '{}' is used twice",
                    a
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Map a sqlx error onto the store error taxonomy.
///
/// `SQLITE_BUSY` and `SQLITE_LOCKED` (primary codes 5 and 6, extended codes
/// included) are transient; so is running out of pooled connections.
fn map_sqlx(operation: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |err| match err {
        sqlx::Error::PoolTimedOut => StoreError::transient(operation, "connection pool timed out"),
        sqlx::Error::PoolClosed => StoreError::Closed,
        sqlx::Error::Io(e) => StoreError::Io(e),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            match code.parse::<i32>() {
                Ok(c) if matches!(c & 0xFF, 5 | 6) => {
                    StoreError::transient(operation, db.message().to_string())
                }
                _ => StoreError::Backend {
                    code: format!("sqlite_{}", code),
                    message: format!("{}: {}", operation, db.message()),
                },
            }
        }
        other => StoreError::Backend {
            code: "sqlx".to_string(),
            message: format!("{}: {}", operation, other),
        },
    }
}

/// Parse a stored JSON body. A body that is not valid JSON is handed on as a
/// bare string so that decoding it fails per document.
fn parse_body(body: String) -> Value {
    serde_json::from_str(&body).unwrap_or(Value::String(body))
}

/// A feed row with an unknown kind is surfaced as an undecodable replace so
/// the projector skips it instead of the whole read failing.
fn parse_change(position: i64, kind: &str, body: String) -> (ChangeKind, Value) {
    match kind.parse::<ChangeKind>() {
        Ok(kind) => (kind, parse_body(body)),
        Err(e) => {
            warn!(position, error = %e, "Feed row has an unknown change kind");
            (ChangeKind::Replace, Value::String(e.to_string()))
        }
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
    names: ContainerNames,
    feed_partitions: u32,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub async fn new<P: AsRef<Path>>(
        path: P,
        names: ContainerNames,
        feed_partitions: u32,
    ) -> Result<Self> {
        names.validate()?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(path = %path.as_ref().display(), "Opened SQLite store");

        Ok(Self {
            pool,
            names,
            feed_partitions: feed_partitions.max(1),
        })
    }

    /// In-memory database (for testing).
    ///
    /// An in-memory SQLite database lives as long as its connection, so the
    /// pool holds exactly one connection that never expires.
    pub async fn new_in_memory(names: ContainerNames, feed_partitions: u32) -> Result<Self> {
        names.validate()?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            names,
            feed_partitions: feed_partitions.max(1),
        })
    }

    pub fn names(&self) -> &ContainerNames {
        &self.names
    }

    pub fn feed_partition_count(&self) -> u32 {
        self.feed_partitions
    }

    /// Create all tables at once.
    pub async fn ensure_all(&self) -> Result<()> {
        PrimaryStore::ensure_exists(self).await?;
        IndexStore::ensure_exists(self).await?;
        CheckpointStore::ensure_exists(self).await
    }

    /// Create or replace a primary record and append the change to the feed.
    pub async fn put_record(&self, record: &PrimaryRecord) -> Result<FeedPosition> {
        let group = record.group_key().unwrap_or_default().to_string();
        let partition = partition_for(record.group_key(), self.feed_partitions);
        let body = serde_json::to_string(&record.to_document())?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx("put_record"))?;

        let existing: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT 1 FROM {} WHERE group_key = ? AND id = ?",
            self.names.primary
        ))
        .bind(&group)
        .bind(&record.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx("put_record"))?;

        let kind = if existing.is_some() {
            ChangeKind::Replace
        } else {
            ChangeKind::Create
        };

        sqlx::query(&format!(
            "INSERT INTO {} (group_key, id, body) VALUES (?, ?, ?) \
             ON CONFLICT(group_key, id) DO UPDATE SET body = excluded.body",
            self.names.primary
        ))
        .bind(&group)
        .bind(&record.id)
        .bind(&body)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx("put_record"))?;

        let position = self
            .append_feed(&mut tx, partition, kind, &body)
            .await?;

        tx.commit().await.map_err(map_sqlx("put_record"))?;
        debug!(partition, position = %position, kind = %kind, "primary record written");
        Ok(position)
    }

    /// Delete a primary record. Returns whether it existed.
    pub async fn delete_record(&self, group_key: Option<&str>, id: &str) -> Result<bool> {
        let group = group_key.unwrap_or_default();
        let mut tx = self.pool.begin().await.map_err(map_sqlx("delete_record"))?;

        let removed = sqlx::query(&format!(
            "DELETE FROM {} WHERE group_key = ? AND id = ?",
            self.names.primary
        ))
        .bind(group)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx("delete_record"))?
        .rows_affected();

        if removed == 0 {
            return Ok(false);
        }

        let mut tombstone = serde_json::Map::new();
        tombstone.insert("id".to_string(), Value::String(id.to_string()));
        if let Some(g) = group_key {
            tombstone.insert(GROUP_KEY_FIELD.to_string(), Value::String(g.to_string()));
        }
        let body = serde_json::to_string(&Value::Object(tombstone))?;
        let partition = partition_for(group_key, self.feed_partitions);
        self.append_feed(&mut tx, partition, ChangeKind::Delete, &body)
            .await?;

        tx.commit().await.map_err(map_sqlx("delete_record"))?;
        Ok(true)
    }

    /// Delete every record of a group. Returns how many were removed.
    pub async fn delete_group(&self, group_key: &str) -> Result<usize> {
        let ids: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {} WHERE group_key = ? ORDER BY id",
            self.names.primary
        ))
        .bind(group_key)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx("delete_group"))?;

        let mut removed = 0;
        for (id,) in ids {
            if self.delete_record(Some(group_key), &id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn append_feed(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        partition: PartitionId,
        kind: ChangeKind,
        body: &str,
    ) -> Result<FeedPosition> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (feed_partition, kind, body) VALUES (?, ?, ?)",
            self.names.feed()
        ))
        .bind(partition as i64)
        .bind(kind.to_string())
        .bind(body)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx("append_feed"))?;

        Ok(FeedPosition(result.last_insert_rowid() as u64))
    }

    /// Store a raw index body as-is (for tests exercising corrupt rows).
    pub async fn insert_raw_index(
        &self,
        partition_key: &str,
        id: &str,
        kind: &str,
        body: &str,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (partition_key, id, kind, body) VALUES (?, ?, ?, ?)",
            self.names.index
        ))
        .bind(partition_key)
        .bind(id)
        .bind(kind)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("insert_raw_index"))?;
        Ok(())
    }

    pub async fn index_len(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", self.names.index))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx("index_len"))?;
        Ok(count as usize)
    }

    async fn close_pool(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            debug!("SQLite pool closed");
        }
    }
}

#[async_trait]
impl PrimaryStore for SqliteStore {
    async fn ensure_exists(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                group_key TEXT NOT NULL, \
                id TEXT NOT NULL, \
                body TEXT NOT NULL, \
                PRIMARY KEY (group_key, id))",
            self.names.primary
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("ensure_primary"))?;

        let feed = self.names.feed();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                position INTEGER PRIMARY KEY AUTOINCREMENT, \
                feed_partition INTEGER NOT NULL, \
                kind TEXT NOT NULL, \
                body TEXT NOT NULL)",
            feed
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("ensure_primary"))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{feed}_partition ON {feed} (feed_partition, position)",
            feed = feed
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("ensure_primary"))?;

        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        Ok((0..self.feed_partitions).collect())
    }

    async fn exists_any(&self, group_key: &str) -> Result<bool> {
        if group_key.is_empty() {
            return Ok(false);
        }
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT 1 FROM {} WHERE group_key = ? LIMIT 1",
            self.names.primary
        ))
        .bind(group_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx("exists_any"))?;
        Ok(row.is_some())
    }

    async fn read_feed(
        &self,
        partition: PartitionId,
        since: FeedPosition,
        max_items: usize,
    ) -> Result<FeedBatch> {
        if partition >= self.feed_partitions {
            return Err(StoreError::InvalidArgument(format!(
                "unknown feed partition {}",
                partition
            )));
        }

        let rows: Vec<(i64, String, String)> = sqlx::query_as(&format!(
            "SELECT position, kind, body FROM {} \
             WHERE feed_partition = ? AND position > ? \
             ORDER BY position LIMIT ?",
            self.names.feed()
        ))
        .bind(partition as i64)
        .bind(since.value() as i64)
        .bind(i64::try_from(max_items.max(1)).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx("read_feed"))?;

        let mut events = Vec::with_capacity(rows.len());
        for (position, kind, body) in rows {
            let (kind, document) = parse_change(position, &kind, body);
            events.push(ChangeEvent {
                partition,
                position: FeedPosition(position as u64),
                kind,
                document,
            });
        }
        Ok(FeedBatch::new(events))
    }

    async fn close(&self) {
        self.close_pool().await;
    }
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn ensure_exists(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                partition_key TEXT NOT NULL, \
                id TEXT NOT NULL, \
                kind TEXT NOT NULL, \
                body TEXT NOT NULL, \
                PRIMARY KEY (partition_key, id))",
            self.names.index
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("ensure_index"))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_kind ON {table} (kind)",
            table = self.names.index
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("ensure_index"))?;

        Ok(())
    }

    async fn upsert(&self, partition_key: &str, document: &IndexDocument) -> Result<()> {
        if document.group_key() != partition_key {
            return Err(StoreError::InvalidArgument(format!(
                "document {} belongs to group '{}', not partition '{}'",
                document.id(),
                document.group_key(),
                partition_key
            )));
        }
        let body = serde_json::to_string(&document.encode()?)?;

        sqlx::query(&format!(
            "INSERT INTO {} (partition_key, id, kind, body) VALUES (?, ?, ?, ?) \
             ON CONFLICT(partition_key, id) DO UPDATE SET kind = excluded.kind, body = excluded.body",
            self.names.index
        ))
        .bind(partition_key)
        .bind(document.id())
        .bind(document.kind())
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("upsert"))?;

        Ok(())
    }

    async fn query(
        &self,
        filter: &IndexFilter,
        partition_key: Option<&str>,
        continuation: Option<&Continuation>,
        page_size: usize,
    ) -> Result<Page<IndexRow>> {
        let page_size = page_size.max(1);

        let mut conditions = Vec::new();
        if continuation.is_some() {
            conditions.push("(partition_key, id) > (?, ?)");
        }
        if partition_key.is_some() {
            conditions.push("partition_key = ?");
        }
        match filter {
            IndexFilter::All => {}
            IndexFilter::KindEquals(_) => conditions.push("kind = ?"),
            IndexFilter::KindNotEquals(_) => conditions.push("kind <> ?"),
        }

        let mut sql = format!("SELECT partition_key, id, body FROM {}", self.names.index);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY partition_key, id LIMIT ?");

        let mut query = sqlx::query_as::<_, (String, String, String)>(&sql);
        if let Some(after) = continuation {
            query = query
                .bind(after.partition_key.as_str())
                .bind(after.id.as_str());
        }
        if let Some(pk) = partition_key {
            query = query.bind(pk);
        }
        match filter {
            IndexFilter::All => {}
            IndexFilter::KindEquals(kind) | IndexFilter::KindNotEquals(kind) => {
                query = query.bind(kind.as_str());
            }
        }
        query = query.bind(i64::try_from(page_size).unwrap_or(i64::MAX));

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx("query"))?;

        let items: Vec<IndexRow> = rows
            .into_iter()
            .map(|(partition_key, id, body)| IndexRow {
                id,
                partition_key,
                document: parse_body(body),
            })
            .collect();

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
        let removed = sqlx::query(&format!(
            "DELETE FROM {} WHERE partition_key = ? AND id = ?",
            self.names.index
        ))
        .bind(partition_key)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("delete"))?
        .rows_affected();

        Ok(if removed == 0 {
            DeleteOutcome::NotFound
        } else {
            DeleteOutcome::Deleted
        })
    }

    async fn close(&self) {
        self.close_pool().await;
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn ensure_exists(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                processor TEXT NOT NULL, \
                feed_partition INTEGER NOT NULL, \
                position INTEGER NOT NULL, \
                owner TEXT NOT NULL, \
                updated_at TEXT NOT NULL, \
                PRIMARY KEY (processor, feed_partition))",
            self.names.leases
        ))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("ensure_leases"))?;
        Ok(())
    }

    async fn load(&self, processor: &str, partition: PartitionId) -> Result<Option<Checkpoint>> {
        let row: Option<(i64, String, String)> = sqlx::query_as(&format!(
            "SELECT position, owner, updated_at FROM {} WHERE processor = ? AND feed_partition = ?",
            self.names.leases
        ))
        .bind(processor)
        .bind(partition as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx("load_checkpoint"))?;

        let Some((position, owner, updated_at)) = row else {
            return Ok(None);
        };

        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| StoreError::Malformed(format!("checkpoint timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(Checkpoint {
            processor: processor.to_string(),
            partition,
            position: FeedPosition(position as u64),
            owner,
            updated_at,
        }))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (processor, feed_partition, position, owner, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(processor, feed_partition) DO UPDATE SET \
             position = excluded.position, owner = excluded.owner, updated_at = excluded.updated_at",
            self.names.leases
        ))
        .bind(&checkpoint.processor)
        .bind(checkpoint.partition as i64)
        .bind(checkpoint.position.value() as i64)
        .bind(&checkpoint.owner)
        .bind(checkpoint.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx("save_checkpoint"))?;
        Ok(())
    }

    async fn close(&self) {
        self.close_pool().await;
    }
}
