use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Registry holding every synchronizer metric
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Change Feed Metrics
    // ============================================================================

    /// Change events turned into marker upserts
    pub static ref EVENTS_PROJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("markersync_events_projected_total", "Change events projected to markers"),
        &["partition"]
    ).expect("metric can be created");

    /// Change events skipped (no group key, malformed, deletes)
    pub static ref EVENTS_SKIPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("markersync_events_skipped_total", "Change events skipped by the projector"),
        &["partition", "reason"]
    ).expect("metric can be created");

    pub static ref BATCHES_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("markersync_batches_failed_total", "Feed batches whose apply failed"),
        &["partition"]
    ).expect("metric can be created");

    /// Last checkpointed feed position
    pub static ref CHECKPOINT_POSITION: IntGaugeVec = IntGaugeVec::new(
        Opts::new("markersync_checkpoint_position", "Last checkpointed feed position"),
        &["partition"]
    ).expect("metric can be created");

    // ============================================================================
    // Sweep Metrics
    // ============================================================================

    pub static ref SWEEPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("markersync_sweeps_total", "Reconciliation sweeps by outcome"),
        &["outcome"]
    ).expect("metric can be created");

    pub static ref MARKERS_CHECKED_TOTAL: IntCounter = IntCounter::new(
        "markersync_markers_checked_total", "Markers evaluated by the sweeper"
    ).expect("metric can be created");

    pub static ref MARKERS_CLEANED_TOTAL: IntCounter = IntCounter::new(
        "markersync_markers_cleaned_total", "Orphaned markers removed by the sweeper"
    ).expect("metric can be created");

    pub static ref DEPENDENTS_DELETED_TOTAL: IntCounter = IntCounter::new(
        "markersync_dependents_deleted_total", "Dependent index records removed with their group"
    ).expect("metric can be created");
}

/// Register all metrics. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(EVENTS_PROJECTED_TOTAL.clone()),
            Box::new(EVENTS_SKIPPED_TOTAL.clone()),
            Box::new(BATCHES_FAILED_TOTAL.clone()),
            Box::new(CHECKPOINT_POSITION.clone()),
            Box::new(SWEEPS_TOTAL.clone()),
            Box::new(MARKERS_CHECKED_TOTAL.clone()),
            Box::new(MARKERS_CLEANED_TOTAL.clone()),
            Box::new(DEPENDENTS_DELETED_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "failed to register metric");
            }
        }
    });
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    init();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
