//! markersync worker
//!
//! Keeps one "group marker" per live group in the index store, driven by the
//! primary store's change feed, and removes markers (with their dependent
//! records) once a group has no members left.
//!
//! ## Components
//!
//! - **Projector** (`projector`): pure mapping from a change event to a marker
//!   upsert; idempotent by construction.
//! - **Change feed reader** (`reader`): one sequential task per feed
//!   partition, at-least-once with checkpoints saved after each batch.
//! - **Sweeper** (`sweeper`): periodic scan that deletes markers of empty
//!   groups and their dependents.
//! - **Supervisor** (`supervisor`): owns the stores and tasks; `start()` /
//!   `stop(timeout)`.
//!
//! Markers are created by the feed and deleted by the sweeper. Neither path
//! takes locks; the stores' per-key atomicity is all that is relied on.

pub mod config;
pub mod error;
pub mod metrics;
pub mod projector;
pub mod reader;
pub mod supervisor;
pub mod sweeper;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use projector::{project, project_at, Projection, Projector, SkipReason};
pub use reader::{PartitionReader, PartitionStatus, ReaderConfig};
pub use supervisor::{Synchronizer, SynchronizerBuilder};
pub use sweeper::{SweepPhase, SweepReport, Sweeper, SweeperConfig};
