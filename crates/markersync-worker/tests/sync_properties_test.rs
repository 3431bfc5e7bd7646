//! End-to-end properties of the synchronizer
//!
//! Feed-driven marker creation, sweeper-driven cleanup, at-least-once
//! checkpointing, per-partition failure isolation and bounded shutdown.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, wait_until, BrokenPartition, FlakyIndex, SlowIndex};
use markersync_core::{
    CheckpointStore, DependentRecord, FeedPosition, IndexDocument, IndexStore, PrimaryRecord,
    PrimaryStore, RetryPolicy, Shutdown,
};
use markersync_store::{partition_for, MemoryStore};
use markersync_worker::{
    PartitionStatus, SweepReport, Sweeper, SweeperConfig, SyncConfig, SyncError, Synchronizer,
};

fn synchronizer(store: &Arc<MemoryStore>, config: SyncConfig) -> Synchronizer {
    Synchronizer::builder()
        .config(config)
        .primary_store(store.clone())
        .index_store(store.clone())
        .checkpoint_store(store.clone())
        .build()
        .unwrap()
}

fn sweeper(store: &Arc<MemoryStore>) -> Sweeper {
    Sweeper::new(
        store.clone(),
        store.clone(),
        SweeperConfig {
            interval: Duration::from_secs(3600),
            page_size: 2,
            retry: RetryPolicy::none(),
        },
        Shutdown::new(),
    )
}

async fn has_marker(store: &MemoryStore, group: &str) -> bool {
    store
        .get_index(group, &markersync_core::marker_id(group))
        .await
        .is_some()
}

async fn add_invite(store: &MemoryStore, id: &str, group: &str) {
    store
        .upsert(
            group,
            &IndexDocument::Dependent(DependentRecord::new(id, group, "invite")),
        )
        .await
        .unwrap();
}

// ============================================================================
// Projection
// ============================================================================

#[tokio::test]
async fn test_feed_creates_one_marker_per_group() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::new("a1", "A")).await.unwrap();
    store.put_record(&PrimaryRecord::new("a2", "A")).await.unwrap();
    store.put_record(&PrimaryRecord::new("b1", "B")).await.unwrap();

    let sync = synchronizer(&store, fast_config());
    sync.start().await.unwrap();

    assert!(wait_until(|| async { has_marker(&store, "A").await && has_marker(&store, "B").await }).await);
    assert_eq!(store.index_len().await, 2);

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_replaying_the_feed_is_idempotent() {
    let store = Arc::new(MemoryStore::new(1));
    for i in 0..6 {
        store
            .put_record(&PrimaryRecord::new(format!("m{}", i), format!("g{}", i % 3)))
            .await
            .unwrap();
    }

    // two processors with independent checkpoints both consume the whole feed
    let mut first = fast_config();
    first.processor_name = "first".to_string();
    let sync = synchronizer(&store, first);
    sync.start().await.unwrap();
    assert!(wait_until(|| async {
        matches!(store.load("first", 0).await, Ok(Some(cp)) if cp.position == FeedPosition(6))
    })
    .await);
    let after_first = store.index_len().await;

    let shutdown = sync.shutdown_handle();
    shutdown.trigger();

    let mut second = fast_config();
    second.processor_name = "second".to_string();
    let replay = synchronizer(&store, second);
    replay.start().await.unwrap();
    assert!(wait_until(|| async {
        matches!(store.load("second", 0).await, Ok(Some(cp)) if cp.position == FeedPosition(6))
    })
    .await);

    assert_eq!(after_first, 3);
    assert_eq!(store.index_len().await, 3);

    replay.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_marker_tracks_latest_change_of_group() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::new("a1", "A")).await.unwrap();
    store.put_record(&PrimaryRecord::new("b1", "B")).await.unwrap();
    let last_a = store
        .put_record(&PrimaryRecord::new("a1", "A").with_field("role", serde_json::json!("parent")))
        .await
        .unwrap();

    let sync = synchronizer(&store, fast_config());
    sync.start().await.unwrap();

    assert!(wait_until(|| async {
        match store.get_index("A", "marker-A").await {
            Some(doc) => doc.as_marker().map(|m| m.source_position) == Some(last_a),
            None => false,
        }
    })
    .await);

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_ungrouped_records_are_skipped_and_checkpointed() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::ungrouped("x1")).await.unwrap();
    let last = store.put_record(&PrimaryRecord::new("m1", "  ")).await.unwrap();

    let sync = synchronizer(&store, fast_config());
    sync.start().await.unwrap();

    assert!(wait_until(|| async {
        matches!(store.load("groupIndexSync", 0).await, Ok(Some(cp)) if cp.position == last)
    })
    .await);
    assert_eq!(store.index_len().await, 0);

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_malformed_event_does_not_block_partition() {
    let store = Arc::new(MemoryStore::new(1));
    store
        .append_raw_change(
            0,
            markersync_core::ChangeKind::Create,
            serde_json::json!({"groupKey": 17}),
        )
        .await;
    store.put_record(&PrimaryRecord::new("m1", "G")).await.unwrap();

    let sync = synchronizer(&store, fast_config());
    sync.start().await.unwrap();

    assert!(wait_until(|| async { has_marker(&store, "G").await }).await);
    assert_eq!(
        sync.partition_status().await.get(&0),
        Some(&PartitionStatus::Running)
    );

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_deleted_marker_is_healed_by_next_change() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::new("a1", "A")).await.unwrap();

    let sync = synchronizer(&store, fast_config());
    sync.start().await.unwrap();
    assert!(wait_until(|| async { has_marker(&store, "A").await }).await);

    store.delete("marker-A", "A").await.unwrap();
    assert!(!has_marker(&store, "A").await);

    store.put_record(&PrimaryRecord::new("a2", "A")).await.unwrap();
    assert!(wait_until(|| async { has_marker(&store, "A").await }).await);

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_two_groups_one_emptied() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::new("a1", "A")).await.unwrap();
    store.put_record(&PrimaryRecord::new("a2", "A")).await.unwrap();
    store.put_record(&PrimaryRecord::new("b1", "B")).await.unwrap();

    let sync = synchronizer(&store, fast_config());
    sync.start().await.unwrap();
    assert!(wait_until(|| async { has_marker(&store, "A").await && has_marker(&store, "B").await }).await);

    add_invite(&store, "invite-a1", "A").await;
    add_invite(&store, "invite-a2", "A").await;
    add_invite(&store, "invite-b1", "B").await;

    assert_eq!(store.delete_group("A").await.unwrap(), 2);
    // let the reader consume the delete events first
    assert!(wait_until(|| async {
        matches!(store.load("groupIndexSync", 0).await, Ok(Some(cp)) if cp.position == FeedPosition(5))
    })
    .await);

    let report = sweeper(&store).sweep_once().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.dependents_deleted, 2);
    assert_eq!(report.failed, 0);

    assert!(!has_marker(&store, "A").await);
    assert!(store.index_documents("A").await.is_empty());
    assert!(has_marker(&store, "B").await);
    assert_eq!(store.index_documents("B").await.len(), 2);

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_live_group_survives_repeated_sweeps() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::new("m1", "alive")).await.unwrap();
    store
        .upsert(
            "alive",
            &IndexDocument::GroupIndexMarker(markersync_core::Marker::new(
                "alive",
                FeedPosition(1),
            )),
        )
        .await
        .unwrap();
    add_invite(&store, "inv-1", "alive").await;

    let sweeper = sweeper(&store);
    for _ in 0..3 {
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.cleaned, 0);
    }
    assert!(has_marker(&store, "alive").await);
    assert_eq!(store.index_len().await, 2);
}

#[tokio::test]
async fn test_sweep_tolerates_marker_already_gone() {
    let store = Arc::new(MemoryStore::new(1));
    for g in ["a", "b", "c"] {
        store
            .upsert(
                g,
                &IndexDocument::GroupIndexMarker(markersync_core::Marker::new(g, FeedPosition(1))),
            )
            .await
            .unwrap();
    }
    let sweeper = sweeper(&store);
    // removed by a concurrent sweeper between runs
    store.delete("marker-b", "b").await.unwrap();
    assert_eq!(
        store.delete("marker-b", "b").await.unwrap(),
        markersync_core::DeleteOutcome::NotFound
    );

    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.cleaned, 2);
    assert_eq!(store.index_len().await, 0);
}

#[tokio::test]
async fn test_background_sweeper_cleans_orphans() {
    let store = Arc::new(MemoryStore::new(1));
    store
        .upsert(
            "ghost",
            &IndexDocument::GroupIndexMarker(markersync_core::Marker::new(
                "ghost",
                FeedPosition(1),
            )),
        )
        .await
        .unwrap();
    add_invite(&store, "inv-ghost", "ghost").await;

    let mut config = fast_config();
    config.sweep_interval = Duration::from_millis(20);
    let sync = synchronizer(&store, config);
    sync.start().await.unwrap();

    assert!(wait_until(|| async { store.index_len().await == 0 }).await);
    assert!(wait_until(|| async {
        matches!(sync.last_sweep().await, Some(SweepReport { cancelled: false, .. }))
    })
    .await);

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

// ============================================================================
// Checkpoints
// ============================================================================

#[tokio::test]
async fn test_checkpoint_not_advanced_while_upserts_fail() {
    let store = Arc::new(MemoryStore::new(1));
    let last = {
        store.put_record(&PrimaryRecord::new("m1", "A")).await.unwrap();
        store.put_record(&PrimaryRecord::new("m2", "B")).await.unwrap()
    };

    let flaky = Arc::new(FlakyIndex::new(store.clone()));
    let sync = Synchronizer::builder()
        .config(fast_config())
        .primary_store(store.clone())
        .index_store(flaky.clone())
        .checkpoint_store(store.clone())
        .build()
        .unwrap();
    sync.start().await.unwrap();

    // the batch is redelivered at least twice without progress
    assert!(wait_until(|| async { flaky.failures() >= 3 }).await);
    assert!(store.load("groupIndexSync", 0).await.unwrap().is_none());
    assert_eq!(store.index_len().await, 0);
    assert_eq!(
        sync.partition_status().await.get(&0),
        Some(&PartitionStatus::Running)
    );

    flaky.heal();
    assert!(wait_until(|| async {
        matches!(store.load("groupIndexSync", 0).await, Ok(Some(cp)) if cp.position == last)
    })
    .await);
    assert!(has_marker(&store, "A").await);
    assert!(has_marker(&store, "B").await);

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_repeated_batch_failures_fail_the_partition() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::new("m1", "A")).await.unwrap();

    let flaky = Arc::new(FlakyIndex::new(store.clone()));
    let mut config = fast_config();
    config.max_consecutive_batch_failures = 2;
    let sync = Synchronizer::builder()
        .config(config)
        .primary_store(store.clone())
        .index_store(flaky.clone())
        .checkpoint_store(store.clone())
        .build()
        .unwrap();
    sync.start().await.unwrap();

    assert!(wait_until(|| async {
        sync.partition_status()
            .await
            .get(&0)
            .map(|s| s.is_failed())
            .unwrap_or(false)
    })
    .await);
    assert!(matches!(
        sync.check_partitions().await,
        Err(SyncError::PartitionFailed { partition: 0, .. })
    ));
    assert!(store.load("groupIndexSync", 0).await.unwrap().is_none());

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_half_applied_batch_is_redelivered_after_restart() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::new("a1", "A")).await.unwrap();
    let last = store.put_record(&PrimaryRecord::new("b1", "B")).await.unwrap();

    // A's marker lands, B's upsert keeps failing
    let flaky = Arc::new(FlakyIndex::failing_after(store.clone(), 1));
    let first = Synchronizer::builder()
        .config(fast_config())
        .primary_store(store.clone())
        .index_store(flaky.clone())
        .checkpoint_store(store.clone())
        .build()
        .unwrap();
    first.start().await.unwrap();
    assert!(wait_until(|| async { flaky.failures() >= 2 }).await);
    assert!(has_marker(&store, "A").await);

    first.shutdown_handle().trigger();
    assert!(wait_until(|| async {
        first.partition_status().await.get(&0) == Some(&PartitionStatus::Stopped)
    })
    .await);
    assert!(store.load("groupIndexSync", 0).await.unwrap().is_none());
    drop(first);

    let second = synchronizer(&store, fast_config());
    second.start().await.unwrap();
    assert!(wait_until(|| async {
        matches!(store.load("groupIndexSync", 0).await, Ok(Some(cp)) if cp.position == last)
    })
    .await);

    assert!(has_marker(&store, "A").await);
    assert!(has_marker(&store, "B").await);
    assert_eq!(store.index_len().await, 2);

    second.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_from_checkpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("markersync.db");
    let names = markersync_store::ContainerNames::default();

    let first_marker = {
        let store = Arc::new(
            markersync_store::SqliteStore::new(&path, names.clone(), 1)
                .await
                .unwrap(),
        );
        store.ensure_all().await.unwrap();
        store.put_record(&PrimaryRecord::new("a1", "A")).await.unwrap();

        let sync = Synchronizer::builder()
            .config(fast_config())
            .primary_store(store.clone())
            .index_store(store.clone())
            .checkpoint_store(store.clone())
            .build()
            .unwrap();
        sync.start().await.unwrap();
        assert!(wait_until(|| async {
            matches!(store.load("groupIndexSync", 0).await, Ok(Some(_)))
        })
        .await);
        sync.stop(Duration::from_secs(5)).await.unwrap();
        first_marker_of(&path, &names, "A").await
    };

    let store = Arc::new(
        markersync_store::SqliteStore::new(&path, names.clone(), 1)
            .await
            .unwrap(),
    );
    let last = store.put_record(&PrimaryRecord::new("b1", "B")).await.unwrap();

    let sync = Synchronizer::builder()
        .config(fast_config())
        .primary_store(store.clone())
        .index_store(store.clone())
        .checkpoint_store(store.clone())
        .build()
        .unwrap();
    sync.start().await.unwrap();
    assert!(wait_until(|| async {
        matches!(store.load("groupIndexSync", 0).await, Ok(Some(cp)) if cp.position == last)
    })
    .await);

    // A's event was not redelivered: its marker is byte-for-byte unchanged
    let page = store
        .query(&markersync_core::IndexFilter::markers(), Some("A"), None, 10)
        .await
        .unwrap();
    assert_eq!(page.items[0].document, first_marker);

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

async fn first_marker_of(
    path: &std::path::Path,
    names: &markersync_store::ContainerNames,
    group: &str,
) -> serde_json::Value {
    let store = markersync_store::SqliteStore::new(path, names.clone(), 1)
        .await
        .unwrap();
    let page = store
        .query(&markersync_core::IndexFilter::markers(), Some(group), None, 10)
        .await
        .unwrap();
    let document = page.items[0].document.clone();
    IndexStore::close(&store).await;
    document
}

// ============================================================================
// Isolation and shutdown
// ============================================================================

#[tokio::test]
async fn test_failed_partition_does_not_stop_others() {
    let store = Arc::new(MemoryStore::new(2));
    let healthy_group = (0..100)
        .map(|i| format!("group-{}", i))
        .find(|g| partition_for(Some(g), 2) == 0)
        .unwrap();
    store
        .put_record(&PrimaryRecord::new("m1", healthy_group.clone()))
        .await
        .unwrap();

    let primary = Arc::new(BrokenPartition {
        inner: store.clone(),
        broken: 1,
    });
    let mut config = fast_config();
    config.feed_partitions = 2;
    let sync = Synchronizer::builder()
        .config(config)
        .primary_store(primary)
        .index_store(store.clone())
        .checkpoint_store(store.clone())
        .build()
        .unwrap();
    sync.start().await.unwrap();

    assert!(wait_until(|| async {
        sync.partition_status()
            .await
            .get(&1)
            .map(|s| s.is_failed())
            .unwrap_or(false)
    })
    .await);
    assert!(wait_until(|| async { has_marker(&store, &healthy_group).await }).await);
    assert_eq!(
        sync.partition_status().await.get(&0),
        Some(&PartitionStatus::Running)
    );

    sync.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_stop_times_out_and_still_closes_stores() {
    let store = Arc::new(MemoryStore::new(1));
    store.put_record(&PrimaryRecord::new("m1", "A")).await.unwrap();

    let slow = Arc::new(SlowIndex {
        inner: store.clone(),
        entered: AtomicBool::new(false),
        delay: Duration::from_secs(30),
    });
    let sync = Synchronizer::builder()
        .config(fast_config())
        .primary_store(store.clone())
        .index_store(slow.clone())
        .checkpoint_store(store.clone())
        .build()
        .unwrap();
    sync.start().await.unwrap();

    assert!(wait_until(|| async { slow.entered.load(Ordering::SeqCst) }).await);

    let result = sync.stop(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(SyncError::ShutdownTimeout(_))));
    assert!(store.is_closed());
    assert!(!sync.is_started().await);
    assert_eq!(
        sync.partition_status().await.get(&0),
        Some(&PartitionStatus::Stopped)
    );
}

#[tokio::test]
async fn test_stop_is_prompt_when_idle() {
    let store = Arc::new(MemoryStore::new(4));
    let mut config = fast_config();
    config.feed_poll_interval = Duration::from_secs(3600);
    let sync = synchronizer(&store, config);
    sync.start().await.unwrap();

    let started = std::time::Instant::now();
    sync.stop(Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(PrimaryStore::exists_any(store.as_ref(), "x").await.is_err());
}
