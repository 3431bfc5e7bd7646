//! markersync binary
//!
//! Runs the synchronizer against a SQLite database until SIGINT or SIGTERM.
//! Configuration is read from the environment (see `markersync_worker::config`).
//!
//! # Example
//!
//! ```bash
//! export MARKERSYNC_DATABASE=./data/markersync.db
//! export MARKERSYNC_FEED_PARTITIONS=8
//! export RUST_LOG=debug
//! cargo run --bin markersync
//! ```

use std::sync::Arc;

use markersync_core::shutdown::os_signal;
use markersync_core::{CheckpointStore, Shutdown};
use markersync_store::{FileCheckpointStore, SqliteStore};
use markersync_worker::{metrics, SyncConfig, Synchronizer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("markersync starting");

    let config = SyncConfig::from_env()?;

    info!("Configuration:");
    info!("  Database: {}", config.database.display());
    info!("  Processor: {}", config.processor_name);
    info!("  Instance: {}", config.instance_name);
    info!(
        "  Containers: primary={} index={} leases={}",
        config.primary_container, config.index_container, config.lease_container
    );
    info!("  Feed partitions: {}", config.feed_partitions);
    info!("  Feed batch size: {}", config.feed_max_batch_size);
    info!("  Feed poll interval: {:?}", config.feed_poll_interval);
    info!("  Sweep interval: {:?}", config.sweep_interval);
    info!("  Shutdown timeout: {:?}", config.shutdown_timeout);

    let store = Arc::new(
        SqliteStore::new(
            &config.database,
            config.container_names(),
            config.feed_partitions,
        )
        .await?,
    );

    let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
        Some(dir) => {
            info!("  Checkpoints: files in {}", dir.display());
            Arc::new(FileCheckpointStore::new(dir))
        }
        None => {
            info!("  Checkpoints: table {}", config.lease_container);
            store.clone()
        }
    };

    let shutdown = Shutdown::new();
    let timeout = config.shutdown_timeout;

    let sync = Synchronizer::builder()
        .config(config)
        .primary_store(store.clone())
        .index_store(store)
        .checkpoint_store(checkpoints)
        .shutdown(shutdown.clone())
        .build()?;

    sync.start().await?;
    info!("markersync running");

    let signal = os_signal().await;
    info!(signal = %signal, "Received shutdown signal, stopping");
    shutdown.trigger_with(signal);

    let result = sync.stop(timeout).await;

    for (partition, status) in sync.partition_status().await {
        if status.is_failed() {
            warn!(partition, status = %status, "Partition ended in failure");
        }
    }
    if let Some(report) = sync.last_sweep().await {
        info!(
            checked = report.checked,
            cleaned = report.cleaned,
            failed = report.failed,
            "Last reconciliation sweep"
        );
    }
    info!("Final metrics:\n{}", metrics::render());

    if let Err(e) = result {
        error!(error = %e, "Shutdown incomplete");
        return Err(e.into());
    }

    info!("markersync stopped");
    Ok(())
}
