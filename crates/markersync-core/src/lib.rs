//! markersync core
//!
//! Shared vocabulary of the index synchronizer:
//!
//! - **Types**: primary records, change events, feed positions, checkpoints
//! - **Documents**: the tagged index documents (group markers and dependent
//!   records) with explicit decoding
//! - **Store traits**: `PrimaryStore`, `IndexStore`, `CheckpointStore`
//! - **Retry**: bounded exponential backoff applied to every store call
//! - **Shutdown**: cooperative cancellation shared by all background loops
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  change feed   ┌─────────────┐  upsert   ┌─────────────┐
//! │ PrimaryStore  │ ─────────────→ │  Projector  │ ────────→ │ IndexStore  │
//! └───────┬───────┘                └─────────────┘           └──────┬──────┘
//!         │ exists_any(group)                                       │ scan markers
//!         └──────────────────────── Sweeper ◄───────────────────────┘
//! ```

pub mod document;
pub mod error;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod types;

pub use document::{marker_id, DependentRecord, IndexDocument, IndexRow, Marker, MARKER_KIND};
pub use error::{Result, StoreError};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use store::{
    CheckpointStore, Continuation, DeleteOutcome, IndexFilter, IndexStore, Page, PrimaryStore,
};
pub use types::{
    ChangeEvent, ChangeKind, Checkpoint, FeedBatch, FeedPosition, PartitionId, PrimaryRecord,
    GROUP_KEY_FIELD,
};
