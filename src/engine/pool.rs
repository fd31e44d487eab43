//! In-process slot pool.
//!
//! At most `concurrency` partitions run at once. A reap loop ticking at
//! `reap_interval` collects finished slots, writes their terminal state and
//! refills the pool from the queue in partition order.

use super::worker::{self, Outcome, WorkerContext};
use crate::error::{RunError, StoreError};
use crate::model::{FailureKind, InfoEvent, RunEvent, TaskState};
use crate::partition::Partition;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Slot {
    partition_id: String,
    handle: JoinHandle<Outcome>,
}

/// Drive every partition in `partitions` through the pool.
///
/// Returns once the queue is drained and every slot reaped, or, after
/// `cancel` fires, once the in-flight slots have been reaped. Partitions
/// never dispatched stay `Pending`.
pub async fn run_pool(
    ctx: &WorkerContext,
    partitions: Vec<Partition>,
    event_tx: &UnboundedSender<RunEvent>,
    paused: Arc<AtomicBool>,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    let capacity = ctx.cfg.concurrency.max(1);
    let mut queue: VecDeque<Partition> = partitions.into();
    let mut slots: Vec<Slot> = Vec::with_capacity(capacity);
    let mut cancel_seen = false;

    let mut tick = tokio::time::interval(ctx.cfg.reap_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(queued = queue.len(), capacity, "pool started");

    loop {
        reap(ctx, &mut slots, event_tx).await;

        if !cancel.is_cancelled() && !paused.load(Ordering::Relaxed) {
            while slots.len() < capacity {
                let Some(partition) = queue.pop_front() else {
                    break;
                };
                if let Some(slot) = dispatch(ctx, partition, event_tx, cancel)? {
                    slots.push(slot);
                }
            }
        }

        if slots.is_empty() && (queue.is_empty() || cancel.is_cancelled()) {
            break;
        }

        tokio::select! {
            _ = tick.tick() => {}
            _ = cancel.cancelled(), if !cancel_seen => {
                cancel_seen = true;
                info!(in_flight = slots.len(), left = queue.len(), "pool cancelling");
                let _ = event_tx.send(RunEvent::Info(InfoEvent::Cancelling));
            }
        }
    }

    if !queue.is_empty() {
        info!(left = queue.len(), "partitions left pending");
    }
    Ok(())
}

fn dispatch(
    ctx: &WorkerContext,
    partition: Partition,
    event_tx: &UnboundedSender<RunEvent>,
    cancel: &CancellationToken,
) -> Result<Option<Slot>, RunError> {
    match worker::claim(ctx, &partition) {
        Ok(_) => {}
        Err(StoreError::InvalidTransition { id, from, .. }) => {
            warn!(task = %id, "not dispatching: already {from}");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }
    debug!(task = %partition.id, "dispatched");
    let _ = event_tx.send(RunEvent::TaskChanged {
        partition_id: partition.id.clone(),
        state: TaskState::Processing,
        detail: None,
    });

    let partition_id = partition.id.clone();
    let ctx = ctx.clone();
    let token = cancel.child_token();
    let handle = tokio::spawn(async move { worker::execute(&ctx, &partition, &token).await });
    Ok(Some(Slot {
        partition_id,
        handle,
    }))
}

async fn reap(ctx: &WorkerContext, slots: &mut Vec<Slot>, event_tx: &UnboundedSender<RunEvent>) {
    let mut i = 0;
    while i < slots.len() {
        if !slots[i].handle.is_finished() {
            i += 1;
            continue;
        }
        let slot = slots.swap_remove(i);
        let outcome = match slot.handle.await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed {
                kind: FailureKind::Exit,
                detail: format!("worker task died: {e}"),
                exit_code: None,
                attempts: 1,
            },
        };
        let state = outcome.state();
        let detail = outcome.detail();
        match worker::finish(ctx, &slot.partition_id, outcome) {
            Ok(_) => {
                match &detail {
                    Some(d) => warn!(task = %slot.partition_id, "failed: {d}"),
                    None => info!(task = %slot.partition_id, "completed"),
                }
                let _ = event_tx.send(RunEvent::TaskChanged {
                    partition_id: slot.partition_id,
                    state,
                    detail,
                });
            }
            Err(e) => warn!(task = %slot.partition_id, "cannot record result: {e}"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::worker::tests::{setup, stub_config};
    use crate::model::TaskRecord;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn run(ctx: &WorkerContext, parts: Vec<Partition>) -> Vec<TaskRecord> {
        let (tx, _rx) = mpsc::unbounded_channel();
        run_pool(
            ctx,
            parts,
            &tx,
            Arc::new(AtomicBool::new(false)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        ctx.store.read_all()
    }

    fn states(records: &[TaskRecord]) -> Vec<TaskState> {
        records.iter().map(|r| r.state).collect()
    }

    #[tokio::test]
    async fn every_partition_runs_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let calls = tmp.path().join("calls");
        let script = format!(r#"echo "$1" >> "{}"; cp "$1" "$2""#, calls.display());
        let (ctx, parts) = setup(tmp.path(), stub_config(tmp.path(), &script), 25);
        assert_eq!(parts.len(), 3);

        let records = run(&ctx, parts).await;

        assert_eq!(states(&records), [TaskState::Completed; 3]);
        let mut seen: Vec<String> = std::fs::read_to_string(calls)
            .unwrap()
            .lines()
            .map(String::from)
            .collect();
        seen.sort();
        assert_eq!(seen.len(), 3);
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"case "$1" in *chunk_01*) exit 1;; esac; cp "$1" "$2""#;
        let (ctx, parts) = setup(tmp.path(), stub_config(tmp.path(), script), 25);

        let records = run(&ctx, parts).await;

        assert_eq!(
            states(&records),
            [TaskState::Completed, TaskState::Failed, TaskState::Completed]
        );
        assert_eq!(records[1].exit_code, Some(1));
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = stub_config(tmp.path(), r#"sleep 0.3; cp "$1" "$2""#);
        cfg.partition_size = 2;
        cfg.concurrency = 2;
        let (ctx, parts) = setup(tmp.path(), cfg, 10);
        assert_eq!(parts.len(), 5);

        let (tx, _rx) = mpsc::unbounded_channel();
        let store = ctx.store.clone();
        let watcher = tokio::spawn(async move {
            let mut peak = 0;
            loop {
                let records = store.read_all();
                let running = records
                    .iter()
                    .filter(|r| r.state == TaskState::Processing)
                    .count();
                peak = peak.max(running);
                if records.iter().all(|r| r.state.is_terminal()) {
                    return peak;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        run_pool(
            &ctx,
            parts,
            &tx,
            Arc::new(AtomicBool::new(false)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let peak = watcher.await.unwrap();
        assert!(peak >= 1 && peak <= 2, "peak concurrency {peak}");
    }

    #[tokio::test]
    async fn cancel_leaves_nothing_processing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = stub_config(tmp.path(), "sleep 30");
        cfg.concurrency = 1;
        let (ctx, parts) = setup(tmp.path(), cfg, 25);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        run_pool(&ctx, parts, &tx, Arc::new(AtomicBool::new(false)), &cancel)
            .await
            .unwrap();

        let records = ctx.store.read_all();
        assert_eq!(
            states(&records),
            [TaskState::Failed, TaskState::Pending, TaskState::Pending]
        );
        assert!(records[0].failure.unwrap().is_cancellation());

        let mut cancelling = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, RunEvent::Info(InfoEvent::Cancelling)) {
                cancelling = true;
            }
        }
        assert!(cancelling);
    }

    #[tokio::test]
    async fn paused_pool_dispatches_nothing_until_resumed() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctx, parts) = setup(tmp.path(), stub_config(tmp.path(), r#"cp "$1" "$2""#), 15);

        let paused = Arc::new(AtomicBool::new(true));
        let resume = paused.clone();
        let store = ctx.store.clone();
        let (tx, _rx) = mpsc::unbounded_channel();
        let resumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let held = store
                .read_all()
                .iter()
                .all(|r| r.state == TaskState::Pending);
            resume.store(false, Ordering::Relaxed);
            held
        });

        run_pool(&ctx, parts, &tx, paused, &CancellationToken::new())
            .await
            .unwrap();

        assert!(resumer.await.unwrap());
        assert_eq!(states(&ctx.store.read_all()), [TaskState::Completed; 2]);
    }
}
