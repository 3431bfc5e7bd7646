//! Synchronizer configuration.
//!
//! # Environment Variables
//!
//! | Variable                        | Default                   |
//! |---------------------------------|---------------------------|
//! | `MARKERSYNC_DATABASE`           | `./data/markersync.db`    |
//! | `MARKERSYNC_PROCESSOR`          | `groupIndexSync`          |
//! | `MARKERSYNC_INSTANCE`           | `markersync-<hostname>`   |
//! | `MARKERSYNC_PRIMARY_CONTAINER`  | `group_members`           |
//! | `MARKERSYNC_INDEX_CONTAINER`    | `group_index`             |
//! | `MARKERSYNC_LEASE_CONTAINER`    | `leases`                  |
//! | `MARKERSYNC_CHECKPOINT_DIR`     | unset (lease table)       |
//! | `MARKERSYNC_FEED_PARTITIONS`    | `4`                       |
//! | `MARKERSYNC_FEED_BATCH_SIZE`    | `100`                     |
//! | `MARKERSYNC_FEED_POLL_MS`       | `1000`                    |
//! | `MARKERSYNC_SWEEP_INTERVAL_SECS`| `30`                      |
//! | `MARKERSYNC_SWEEP_PAGE_SIZE`    | `100`                     |
//! | `MARKERSYNC_MAX_RETRIES`        | `5`                       |
//! | `MARKERSYNC_MAX_BATCH_FAILURES` | `5`                       |
//! | `SHUTDOWN_TIMEOUT_SECS`         | `30`                      |

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use markersync_core::RetryPolicy;
use markersync_store::ContainerNames;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite database file holding the containers
    pub database: PathBuf,

    /// Change feed processor name; checkpoints are namespaced by it
    pub processor_name: String,

    /// Name of this instance, recorded as checkpoint owner
    pub instance_name: String,

    pub primary_container: String,
    pub index_container: String,
    pub lease_container: String,

    /// Keep checkpoints as files in this directory instead of the lease table
    pub checkpoint_dir: Option<PathBuf>,

    /// Number of change feed partitions (default: 4)
    pub feed_partitions: u32,

    /// Maximum events per feed poll (default: 100)
    pub feed_max_batch_size: usize,

    /// Wait after an empty poll (default: 1s)
    pub feed_poll_interval: Duration,

    /// Pause between two sweeps (default: 30s)
    pub sweep_interval: Duration,

    /// Markers per scan page (default: 100)
    pub sweep_page_size: usize,

    /// Retries per store call after the first attempt (default: 5)
    pub max_retries: usize,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,

    /// Consecutive failed batches before a partition is failed (default: 5)
    pub max_consecutive_batch_failures: u32,

    /// Grace period for `stop` (default: 30s)
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("./data/markersync.db"),
            processor_name: "groupIndexSync".to_string(),
            instance_name: default_instance_name(),
            primary_container: "group_members".to_string(),
            index_container: "group_index".to_string(),
            lease_container: "leases".to_string(),
            checkpoint_dir: None,
            feed_partitions: 4,
            feed_max_batch_size: 100,
            feed_poll_interval: Duration::from_millis(1000),
            sweep_interval: Duration::from_secs(30),
            sweep_page_size: 100,
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            max_consecutive_batch_failures: 5,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

fn default_instance_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(|s| format!("markersync-{}", s)))
        .unwrap_or_else(|| format!("markersync-{}", uuid::Uuid::new_v4()))
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup; unset keys keep
    /// their defaults, unparsable values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("MARKERSYNC_DATABASE") {
            config.database = PathBuf::from(v);
        }
        if let Some(v) = lookup("MARKERSYNC_PROCESSOR") {
            config.processor_name = v;
        }
        if let Some(v) = lookup("MARKERSYNC_INSTANCE") {
            config.instance_name = v;
        }
        if let Some(v) = lookup("MARKERSYNC_PRIMARY_CONTAINER") {
            config.primary_container = v;
        }
        if let Some(v) = lookup("MARKERSYNC_INDEX_CONTAINER") {
            config.index_container = v;
        }
        if let Some(v) = lookup("MARKERSYNC_LEASE_CONTAINER") {
            config.lease_container = v;
        }
        config.checkpoint_dir = lookup("MARKERSYNC_CHECKPOINT_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        if let Some(v) = parse::<u32, _>(&lookup, "MARKERSYNC_FEED_PARTITIONS")? {
            config.feed_partitions = v;
        }
        if let Some(v) = parse::<usize, _>(&lookup, "MARKERSYNC_FEED_BATCH_SIZE")? {
            config.feed_max_batch_size = v;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "MARKERSYNC_FEED_POLL_MS")? {
            config.feed_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "MARKERSYNC_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = parse::<usize, _>(&lookup, "MARKERSYNC_SWEEP_PAGE_SIZE")? {
            config.sweep_page_size = v;
        }
        if let Some(v) = parse::<usize, _>(&lookup, "MARKERSYNC_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = parse::<u32, _>(&lookup, "MARKERSYNC_MAX_BATCH_FAILURES")? {
            config.max_consecutive_batch_failures = v;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("processor_name", &self.processor_name),
            ("instance_name", &self.instance_name),
            ("primary_container", &self.primary_container),
            ("index_container", &self.index_container),
            ("lease_container", &self.lease_container),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::Config(format!("{} must not be empty", name)));
            }
        }

        if self.feed_partitions == 0 {
            return Err(SyncError::Config("feed_partitions must be at least 1".to_string()));
        }
        if self.feed_max_batch_size == 0 {
            return Err(SyncError::Config(
                "feed_max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.sweep_page_size == 0 {
            return Err(SyncError::Config("sweep_page_size must be at least 1".to_string()));
        }
        if self.max_consecutive_batch_failures == 0 {
            return Err(SyncError::Config(
                "max_consecutive_batch_failures must be at least 1".to_string(),
            ));
        }
        if self.feed_poll_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(SyncError::Config("intervals must be non-zero".to_string()));
        }

        self.container_names()
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn container_names(&self) -> ContainerNames {
        ContainerNames {
            primary: self.primary_container.clone(),
            index: self.index_container.clone(),
            leases: self.lease_container.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.initial_backoff, self.max_backoff, 2.0)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SyncError::Config(format!("{}='{}': {}", key, raw, e))),
    }
}
