//! Periodic read-only snapshots of the task store.
//!
//! The aggregator never writes a record. Each tick it reads every status
//! record, folds them into a fresh [`RunSnapshot`] and publishes it.

use crate::metrics;
use crate::model::{RunEvent, RunSnapshot, TaskRecord, TaskState};
use crate::store::TaskStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fold records into counts. Expected partitions with no readable record count as unknown.
pub fn snapshot_from(
    records: &[TaskRecord],
    total: usize,
    items_total: u64,
    elapsed: Duration,
) -> RunSnapshot {
    let mut snap = RunSnapshot {
        total,
        items_total,
        elapsed_seconds: elapsed.as_secs_f64(),
        ..Default::default()
    };
    for rec in records {
        match rec.state {
            TaskState::Completed => {
                snap.completed += 1;
                snap.items_completed += rec.items;
            }
            TaskState::Failed => snap.failed += 1,
            TaskState::Processing => snap.processing += 1,
            TaskState::Pending => snap.pending += 1,
            TaskState::Unknown => snap.unknown += 1,
        }
    }
    let seen = snap.completed + snap.failed + snap.processing + snap.pending + snap.unknown;
    snap.unknown += total.saturating_sub(seen);

    snap.throughput_per_minute = metrics::throughput_per_minute(snap.completed, elapsed);
    snap.eta_minutes = metrics::eta_minutes(total, snap.completed, snap.throughput_per_minute);
    snap
}

pub struct Aggregator {
    pub store: TaskStore,
    pub total: usize,
    pub items_total: u64,
    pub interval: Duration,
    pub started: Instant,
}

impl Aggregator {
    pub async fn read(&self) -> RunSnapshot {
        let store = self.store.clone();
        let records = tokio::task::spawn_blocking(move || store.read_all())
            .await
            .unwrap_or_default();
        snapshot_from(
            &records,
            self.total,
            self.items_total,
            self.started.elapsed(),
        )
    }

    /// Publish a snapshot every `interval` until `stop` fires.
    pub async fn run(self, event_tx: UnboundedSender<RunEvent>, stop: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {
                    let snap = self.read().await;
                    debug!(
                        completed = snap.completed,
                        failed = snap.failed,
                        processing = snap.processing,
                        pending = snap.pending,
                        "snapshot"
                    );
                    if event_tx.send(RunEvent::Snapshot(Arc::new(snap))).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, state: TaskState, items: u64) -> TaskRecord {
        TaskRecord {
            state,
            ..TaskRecord::pending(id, items)
        }
    }

    #[test]
    fn counts_always_add_up_to_total() {
        let records = [
            rec("00", TaskState::Completed, 10),
            rec("01", TaskState::Failed, 10),
            rec("02", TaskState::Processing, 10),
            rec("03", TaskState::Unknown, 0),
        ];
        // Two expected partitions have no record at all.
        let snap = snapshot_from(&records, 6, 55, Duration::from_secs(120));

        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.processing, 1);
        assert_eq!(snap.pending, 0);
        assert_eq!(snap.unknown, 3);
        assert_eq!(
            snap.completed + snap.failed + snap.processing + snap.pending + snap.unknown,
            snap.total
        );
        assert_eq!(snap.items_completed, 10);
        assert!((snap.throughput_per_minute - 0.5).abs() < 1e-9);
        assert_eq!(snap.eta_minutes, Some(10.0));
    }

    #[test]
    fn no_progress_means_no_eta() {
        let records = [rec("00", TaskState::Pending, 3)];
        let snap = snapshot_from(&records, 1, 3, Duration::from_secs(5));
        assert_eq!(snap.throughput_per_minute, 0.0);
        assert_eq!(snap.eta_minutes, None);
        assert!(!snap.is_settled());
    }

    #[tokio::test]
    async fn publishes_until_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        store.create_pending("00", 4).unwrap();
        let agg = Aggregator {
            store,
            total: 1,
            items_total: 4,
            interval: Duration::from_millis(10),
            started: Instant::now(),
        };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(agg.run(tx, stop.clone()));

        match rx.recv().await {
            Some(RunEvent::Snapshot(snap)) => {
                assert_eq!(snap.pending, 1);
                assert_eq!(snap.total, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        stop.cancel();
        handle.await.unwrap();
    }
}
