//! Synchronizer lifecycle.
//!
//! The [`Synchronizer`] owns the store handles and every background task:
//! one [`PartitionReader`] per change feed partition and one [`Sweeper`].
//!
//! # Lifecycle
//!
//! 1. **Build**: configure through [`SynchronizerBuilder`]
//! 2. **Start**: ensure containers exist, load partitions, spawn tasks
//! 3. **Run**: readers project changes, the sweeper removes orphans
//! 4. **Stop**: signal shutdown, wait up to a deadline, abort stragglers,
//!    close the stores
//!
//! # Examples
//!
//! ```ignore
//! let sync = Synchronizer::builder()
//!     .config(SyncConfig::from_env()?)
//!     .primary_store(store.clone())
//!     .index_store(store.clone())
//!     .checkpoint_store(store.clone())
//!     .build()?;
//!
//! sync.start().await?;
//! // ...
//! sync.stop(Duration::from_secs(30)).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use markersync_core::{
    retry_with_backoff, CheckpointStore, IndexStore, PartitionId, PrimaryStore, Shutdown,
};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::projector::Projector;
use crate::reader::{PartitionReader, PartitionStatus, ReaderConfig};
use crate::sweeper::{SweepPhase, SweepReport, Sweeper, SweeperConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Created,
    Started,
    Stopped,
}

/// Receivers kept after start for introspection.
#[derive(Default)]
struct Observers {
    partitions: BTreeMap<PartitionId, watch::Receiver<PartitionStatus>>,
    sweep_phase: Option<watch::Receiver<SweepPhase>>,
    last_sweep: Option<watch::Receiver<Option<SweepReport>>>,
}

pub struct Synchronizer {
    config: SyncConfig,
    primary: Arc<dyn PrimaryStore>,
    index: Arc<dyn IndexStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    shutdown: Shutdown,
    state: RwLock<SyncState>,
    /// Task handles, tagged with the feed partition for reader tasks.
    tasks: Mutex<Vec<(Option<PartitionId>, JoinHandle<()>)>>,
    observers: RwLock<Observers>,
}

impl Synchronizer {
    pub fn builder() -> SynchronizerBuilder {
        SynchronizerBuilder::new()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shutdown handle shared by every task; triggering it is equivalent to
    /// the first half of `stop`.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Ensure containers exist and spawn the readers and the sweeper.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted`: called more than once
    /// - `Store`: a container could not be created or the partition list
    ///   could not be read
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != SyncState::Created {
            return Err(SyncError::AlreadyStarted);
        }

        metrics::init();
        let retry = self.config.retry_policy();

        info!(
            processor = %self.config.processor_name,
            instance = %self.config.instance_name,
            "Starting synchronizer"
        );

        retry_with_backoff(&retry, &self.shutdown, "ensure_primary", || {
            self.primary.ensure_exists()
        })
        .await?;
        retry_with_backoff(&retry, &self.shutdown, "ensure_index", || {
            self.index.ensure_exists()
        })
        .await?;
        retry_with_backoff(&retry, &self.shutdown, "ensure_leases", || {
            self.checkpoints.ensure_exists()
        })
        .await?;

        let partitions = retry_with_backoff(&retry, &self.shutdown, "partitions", || {
            self.primary.partitions()
        })
        .await?;

        let projector = Projector::new(self.index.clone(), retry.clone(), self.shutdown.clone());
        let reader_config = ReaderConfig {
            processor_name: self.config.processor_name.clone(),
            owner: self.config.instance_name.clone(),
            max_batch_size: self.config.feed_max_batch_size,
            poll_interval: self.config.feed_poll_interval,
            max_consecutive_batch_failures: self.config.max_consecutive_batch_failures,
            retry: retry.clone(),
        };

        let mut tasks = self.tasks.lock().await;
        let mut observers = self.observers.write().await;

        for partition in &partitions {
            let reader = PartitionReader::new(
                *partition,
                self.primary.clone(),
                self.checkpoints.clone(),
                projector.clone(),
                reader_config.clone(),
                self.shutdown.clone(),
            );
            observers.partitions.insert(*partition, reader.status());
            tasks.push((
                Some(*partition),
                tokio::spawn(async move {
                    reader.run().await;
                }),
            ));
        }

        let sweeper = Sweeper::new(
            self.primary.clone(),
            self.index.clone(),
            SweeperConfig {
                interval: self.config.sweep_interval,
                page_size: self.config.sweep_page_size,
                retry,
            },
            self.shutdown.clone(),
        );
        observers.sweep_phase = Some(sweeper.phase());
        observers.last_sweep = Some(sweeper.last_report());
        tasks.push((None, tokio::spawn(sweeper.run())));

        *state = SyncState::Started;
        info!(
            partitions = partitions.len(),
            "Synchronizer started"
        );
        Ok(())
    }

    /// Signal shutdown, wait for every task up to `timeout`, then close the
    /// stores.
    ///
    /// Tasks still running at the deadline are aborted and
    /// `ShutdownTimeout` is returned; the stores are closed either way.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.write().await;
        match *state {
            SyncState::Stopped => {
                warn!("Synchronizer already stopped, skipping stop");
                return Ok(());
            }
            SyncState::Created => {
                self.close_stores().await;
                *state = SyncState::Stopped;
                return Ok(());
            }
            SyncState::Started => {}
        }

        info!(timeout_ms = timeout.as_millis() as u64, "Stopping synchronizer");
        self.shutdown.trigger();

        let deadline = tokio::time::Instant::now() + timeout;
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let mut aborted = 0;

        for (partition, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Background task panicked"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                    if let Some(partition) = partition {
                        self.mark_stopped(partition).await;
                    }
                }
            }
        }

        self.close_stores().await;
        *state = SyncState::Stopped;

        if aborted > 0 {
            warn!(aborted, "Tasks did not stop in time and were aborted");
            return Err(SyncError::ShutdownTimeout(timeout));
        }

        info!("Synchronizer stopped");
        Ok(())
    }

    /// Aborted readers never publish a final status; record it for them.
    async fn mark_stopped(&self, partition: PartitionId) {
        let (_, status) = watch::channel(PartitionStatus::Stopped);
        self.observers
            .write()
            .await
            .partitions
            .insert(partition, status);
    }

    async fn close_stores(&self) {
        self.primary.close().await;
        self.index.close().await;
        self.checkpoints.close().await;
    }

    pub async fn is_started(&self) -> bool {
        *self.state.read().await == SyncState::Started
    }

    /// Current status of every feed partition.
    pub async fn partition_status(&self) -> BTreeMap<PartitionId, PartitionStatus> {
        self.observers
            .read()
            .await
            .partitions
            .iter()
            .map(|(partition, status)| (*partition, status.borrow().clone()))
            .collect()
    }

    /// `PartitionFailed` for the first failed partition, if any.
    pub async fn check_partitions(&self) -> Result<()> {
        for (partition, status) in self.partition_status().await {
            if let PartitionStatus::Failed(reason) = status {
                return Err(SyncError::PartitionFailed { partition, reason });
            }
        }
        Ok(())
    }

    /// Report of the most recent completed sweep.
    pub async fn last_sweep(&self) -> Option<SweepReport> {
        self.observers
            .read()
            .await
            .last_sweep
            .as_ref()
            .and_then(|rx| rx.borrow().clone())
    }

    /// Sweeper phase changes; `None` before `start`.
    pub async fn sweep_phase(&self) -> Option<watch::Receiver<SweepPhase>> {
        self.observers.read().await.sweep_phase.clone()
    }
}

/// Builder for [`Synchronizer`]
pub struct SynchronizerBuilder {
    config: SyncConfig,
    primary: Option<Arc<dyn PrimaryStore>>,
    index: Option<Arc<dyn IndexStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    shutdown: Option<Shutdown>,
}

impl SynchronizerBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            primary: None,
            index: None,
            checkpoints: None,
            shutdown: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn primary_store(mut self, store: Arc<dyn PrimaryStore>) -> Self {
        self.primary = Some(store);
        self
    }

    pub fn index_store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.index = Some(store);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Use an existing shutdown handle (e.g. one wired to OS signals).
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn build(self) -> Result<Synchronizer> {
        self.config.validate()?;

        let primary = self
            .primary
            .ok_or_else(|| SyncError::Config("primary store is required".to_string()))?;
        let index = self
            .index
            .ok_or_else(|| SyncError::Config("index store is required".to_string()))?;
        let checkpoints = self
            .checkpoints
            .ok_or_else(|| SyncError::Config("checkpoint store is required".to_string()))?;

        Ok(Synchronizer {
            config: self.config,
            primary,
            index,
            checkpoints,
            shutdown: self.shutdown.unwrap_or_default(),
            state: RwLock::new(SyncState::Created),
            tasks: Mutex::new(Vec::new()),
            observers: RwLock::new(Observers::default()),
        })
    }
}

impl Default for SynchronizerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
