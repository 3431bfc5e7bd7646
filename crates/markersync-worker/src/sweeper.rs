//! Reconciliation sweeper.
//!
//! The change feed only ever creates or refreshes markers. Removing the
//! marker of a group whose last member was deleted is the sweeper's job:
//!
//! ```text
//! Idle ──→ Scanning ──→ Evaluating ──→ Cleaning
//!  ▲         │  ▲           │              │
//!  │         │  └── alive ──┘              │
//!  │         │  └──────── next marker ─────┘
//!  └─────────┘ (no more pages / cancelled / scan error)
//! ```
//!
//! A sweep runs immediately on start and then every `interval`. Sweeps never
//! overlap: the next one is scheduled only after the previous returns.
//!
//! A group may gain a member between the existence probe and the delete.
//! The marker is then missing until that member's change event re-projects
//! it; the window is accepted.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use markersync_core::{
    retry_with_backoff, Continuation, DeleteOutcome, IndexDocument, IndexFilter, IndexRow,
    IndexStore, Marker, PrimaryStore, Result, RetryPolicy, Shutdown, StoreError,
};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Idle,
    Scanning,
    Evaluating,
    Cleaning,
}

impl std::fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepPhase::Idle => write!(f, "idle"),
            SweepPhase::Scanning => write!(f, "scanning"),
            SweepPhase::Evaluating => write!(f, "evaluating"),
            SweepPhase::Cleaning => write!(f, "cleaning"),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Markers examined
    pub checked: usize,
    /// Orphaned markers removed
    pub cleaned: usize,
    /// Markers whose probe or cleanup failed, or that could not be decoded
    pub failed: usize,
    pub dependents_deleted: usize,
    /// Shutdown ended the sweep before the scan finished
    pub cancelled: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub page_size: usize,
    pub retry: RetryPolicy,
}

pub struct Sweeper {
    primary: Arc<dyn PrimaryStore>,
    index: Arc<dyn IndexStore>,
    config: SweeperConfig,
    shutdown: Shutdown,
    phase: watch::Sender<SweepPhase>,
    last_report: watch::Sender<Option<SweepReport>>,
}

impl Sweeper {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        index: Arc<dyn IndexStore>,
        config: SweeperConfig,
        shutdown: Shutdown,
    ) -> Self {
        let (phase, _) = watch::channel(SweepPhase::Idle);
        let (last_report, _) = watch::channel(None);
        Self {
            primary,
            index,
            config,
            shutdown,
            phase,
            last_report,
        }
    }

    pub fn phase(&self) -> watch::Receiver<SweepPhase> {
        self.phase.subscribe()
    }

    pub fn last_report(&self) -> watch::Receiver<Option<SweepReport>> {
        self.last_report.subscribe()
    }

    fn enter(&self, phase: SweepPhase) {
        self.phase.send_if_modified(|current| {
            if *current != phase {
                *current = phase;
                true
            } else {
                false
            }
        });
    }

    /// Sweep on a fixed cadence until shutdown.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            page_size = self.config.page_size,
            "Reconciliation sweeper started"
        );

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }

            match self.sweep_once().await {
                Ok(report) => {
                    let outcome = if report.cancelled {
                        "cancelled"
                    } else {
                        "completed"
                    };
                    metrics::SWEEPS_TOTAL.with_label_values(&[outcome]).inc();
                }
                Err(e) => {
                    metrics::SWEEPS_TOTAL.with_label_values(&["failed"]).inc();
                    error!(error = %e, code = e.code(), "Reconciliation sweep aborted");
                }
            }

            if !self.shutdown.sleep(self.config.interval).await {
                break;
            }
        }

        info!("Reconciliation sweeper stopped");
    }

    /// Run a single sweep.
    ///
    /// Returns an error only when scanning the markers fails; per-marker
    /// failures are counted in the report.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::default();
        info!("Starting reconciliation sweep");

        let result = self.scan(&mut report).await;
        self.enter(SweepPhase::Idle);
        report.duration = started.elapsed();
        result?;

        metrics::MARKERS_CHECKED_TOTAL.inc_by(report.checked as u64);
        metrics::MARKERS_CLEANED_TOTAL.inc_by(report.cleaned as u64);
        metrics::DEPENDENTS_DELETED_TOTAL.inc_by(report.dependents_deleted as u64);

        info!(
            checked = report.checked,
            cleaned = report.cleaned,
            failed = report.failed,
            dependents_deleted = report.dependents_deleted,
            cancelled = report.cancelled,
            duration_ms = report.duration.as_millis() as u64,
            "Reconciliation sweep complete"
        );
        self.last_report.send_replace(Some(report.clone()));
        Ok(report)
    }

    async fn scan(&self, report: &mut SweepReport) -> Result<()> {
        let markers = IndexFilter::markers();
        let mut continuation: Option<Continuation> = None;

        loop {
            self.enter(SweepPhase::Scanning);

            let page = self
                .shutdown
                .guard(retry_with_backoff(
                    &self.config.retry,
                    &self.shutdown,
                    "query_markers",
                    || {
                        self.index.query(
                            &markers,
                            None,
                            continuation.as_ref(),
                            self.config.page_size,
                        )
                    },
                ))
                .await;

            let page = match page {
                None => {
                    report.cancelled = true;
                    return Ok(());
                }
                Some(Err(e)) if self.shutdown.is_shutdown() => {
                    debug!(error = %e, "Marker scan interrupted by shutdown");
                    report.cancelled = true;
                    return Ok(());
                }
                Some(result) => result?,
            };

            for row in &page.items {
                if self.shutdown.is_shutdown() {
                    report.cancelled = true;
                    return Ok(());
                }
                self.evaluate(row, report).await;
            }

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Probe one marker's group and clean it up when no member is left.
    async fn evaluate(&self, row: &IndexRow, report: &mut SweepReport) {
        report.checked += 1;

        let marker = match row.decode() {
            Ok(IndexDocument::GroupIndexMarker(marker)) => marker,
            Ok(other) => {
                warn!(
                    id = %row.id,
                    kind = %other.kind(),
                    "Marker query returned a non-marker document"
                );
                report.failed += 1;
                return;
            }
            Err(e) => {
                warn!(
                    id = %row.id,
                    partition_key = %row.partition_key,
                    error = %e,
                    "Skipping undecodable marker"
                );
                report.failed += 1;
                return;
            }
        };

        self.enter(SweepPhase::Evaluating);
        let alive = retry_with_backoff(&self.config.retry, &self.shutdown, "exists_any", || {
            self.primary.exists_any(&marker.group_key)
        })
        .await;

        match alive {
            Ok(true) => {}
            Ok(false) => {
                self.enter(SweepPhase::Cleaning);
                match self.clean_group(&marker).await {
                    Ok(dependents) => {
                        report.cleaned += 1;
                        report.dependents_deleted += dependents;
                        warn!(
                            group_key = %marker.group_key,
                            dependents_deleted = dependents,
                            "Cleaned up empty group"
                        );
                    }
                    Err((operation, e)) => {
                        report.failed += 1;
                        warn!(
                            group_key = %marker.group_key,
                            operation,
                            error = %e,
                            "Group cleanup failed"
                        );
                    }
                }
            }
            Err(e) => {
                report.failed += 1;
                warn!(
                    group_key = %marker.group_key,
                    operation = "exists_any",
                    error = %e,
                    "Group existence probe failed"
                );
            }
        }
    }

    /// Delete every dependent record of the group, then the marker.
    /// Returns the number of dependents removed.
    ///
    /// The marker goes last so that a cleanup that fails part way leaves
    /// the group visible to the next sweep. Retries inside a cleanup are
    /// not cut short by shutdown.
    async fn clean_group(
        &self,
        marker: &Marker,
    ) -> std::result::Result<usize, (&'static str, StoreError)> {
        let group_key = marker.group_key.as_str();
        let in_flight = Shutdown::new();

        let dependents = IndexFilter::dependents();
        let mut continuation: Option<Continuation> = None;
        let mut deleted = 0;

        loop {
            let page = retry_with_backoff(&self.config.retry, &in_flight, "query_dependents", || {
                self.index.query(
                    &dependents,
                    Some(group_key),
                    continuation.as_ref(),
                    self.config.page_size,
                )
            })
            .await
            .map_err(|e| ("query_dependents", e))?;

            for row in &page.items {
                let outcome =
                    retry_with_backoff(&self.config.retry, &in_flight, "delete_dependent", || {
                        self.index.delete(&row.id, &row.partition_key)
                    })
                    .await
                    .map_err(|e| ("delete_dependent", e))?;
                if outcome == DeleteOutcome::Deleted {
                    deleted += 1;
                }
            }

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        let outcome = retry_with_backoff(&self.config.retry, &in_flight, "delete_marker", || {
            self.index.delete(&marker.id, group_key)
        })
        .await
        .map_err(|e| ("delete_marker", e))?;
        if outcome == DeleteOutcome::NotFound {
            debug!(group_key, "Marker already gone");
        }

        Ok(deleted)
    }
}
