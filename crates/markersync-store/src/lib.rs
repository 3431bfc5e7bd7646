//! markersync store backends
//!
//! Concrete implementations of the `markersync-core` store traits:
//!
//! - **MemoryStore**: primary, index and checkpoint store in one process-local
//!   structure. Used by tests and local development.
//! - **SqliteStore**: the same three roles on an embedded SQLite database.
//!   Each logical container is a table; the change feed is an append-only
//!   log table whose `AUTOINCREMENT` key is the feed position.
//! - **FileCheckpointStore**: checkpoints as one JSON file per
//!   `(processor, partition)`, written atomically.
//!
//! ## Feed partitioning
//!
//! Both primary backends route a change to a feed partition by hashing its
//! group key with SipHash (see [`partition_for`]). All changes of one group
//! therefore land in the same partition and keep their commit order.

pub mod file_checkpoint;
pub mod memory;
pub mod sqlite;

pub use file_checkpoint::FileCheckpointStore;
pub use memory::MemoryStore;
pub use sqlite::{ContainerNames, SqliteStore};

use markersync_core::PartitionId;
use std::hash::{Hash, Hasher};

/// Feed partition of a group key.
///
/// Records without a group key all go to partition 0.
pub fn partition_for(group_key: Option<&str>, partition_count: u32) -> PartitionId {
    match group_key {
        Some(key) if partition_count > 1 => {
            let mut hasher = siphasher::sip::SipHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partition_count as u64) as u32
        }
        _ => 0,
    }
}
