//! Long-lived tasks launched by the coordinator besides the per-chain
//! scanners and feeds.

use crate::analytics::{AnalyticsEngine, AnalyticsStore, ApplyOutcome};
use crate::anomaly::AlertLog;
use crate::ingest::{IngestReceiver, Received};
use crate::store::{write_snapshots, SnapshotSink};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Single writer for all analytics state.
pub(crate) async fn run_consumer(
    mut engine: AnalyticsEngine,
    mut rx: IngestReceiver,
    shutdown: CancellationToken,
) {
    info!("ingest consumer started");
    let mut applied: u64 = 0;

    while !shutdown.is_cancelled() {
        match rx.next().await {
            Received::Event(event) => {
                applied += 1;
                match engine.apply(&event) {
                    ApplyOutcome::Vote { alerts, .. } if !alerts.is_empty() => {
                        debug!(alerts = alerts.len(), tx = %event.tx_hash, "vote raised alerts");
                    }
                    _ => {}
                }
            }
            Received::Idle => continue,
            Received::Closed => {
                info!("ingest queue closed");
                break;
            }
        }
    }

    info!(applied = applied, pending = rx.len(), "ingest consumer stopped");
}

pub(crate) struct SnapshotSchedule {
    pub interval: Duration,
    pub retry: Duration,
    pub ttl: Duration,
    pub prefix: String,
}

pub(crate) async fn run_snapshots(
    analytics: AnalyticsStore,
    sink: Arc<dyn SnapshotSink>,
    schedule: SnapshotSchedule,
    shutdown: CancellationToken,
) {
    info!(
        sink = sink.name(),
        interval_secs = schedule.interval.as_secs(),
        ttl_secs = schedule.ttl.as_secs(),
        "snapshot cache started"
    );

    while !shutdown.is_cancelled() {
        let delay = match write_snapshots(&analytics, sink.as_ref(), &schedule.prefix, schedule.ttl).await {
            Ok(written) => {
                info!(sink = sink.name(), proposals = written, "snapshot pass done");
                schedule.interval
            }
            Err(e) => {
                warn!(
                    sink = sink.name(),
                    error = %e,
                    retry_secs = schedule.retry.as_secs(),
                    "snapshot pass failed"
                );
                schedule.retry
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("snapshot cache stopped");
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CleanupReport {
    pub alerts: usize,
    pub history: usize,
}

/// Drop alerts and history events older than `now - retention`.
pub(crate) fn cleanup_pass(
    alerts: &AlertLog,
    analytics: &AnalyticsStore,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> CleanupReport {
    let cutoff = now - retention;
    CleanupReport {
        alerts: alerts.purge_older_than(cutoff),
        history: analytics.trim_history(cutoff),
    }
}

pub(crate) async fn run_cleanup(
    alerts: AlertLog,
    analytics: AnalyticsStore,
    retention: chrono::Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        retention_days = retention.num_days(),
        interval_secs = interval.as_secs(),
        "cleanup started"
    );

    while !shutdown.is_cancelled() {
        let report = cleanup_pass(&alerts, &analytics, retention, Utc::now());
        info!(
            alerts_removed = report.alerts,
            events_removed = report.history,
            alerts_kept = alerts.len(),
            "cleanup pass done"
        );

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("cleanup stopped");
}
