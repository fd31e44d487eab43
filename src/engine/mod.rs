pub mod external;
pub mod invocation;
pub mod pool;
pub mod worker;

use crate::aggregator::{self, Aggregator};
use crate::error::RunError;
use crate::model::{FailureKind, InfoEvent, RunConfig, RunEvent, RunReport, Strategy, TaskState};
use crate::partition;
use crate::report;
use crate::storage::{self, RunLayout};
use crate::store::TaskStore;
use anyhow::{Context, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker::WorkerContext;

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Pause (true) or resume (false) dispatch of new partitions
    Pause(bool),
    /// Stop dispatching and terminate in-flight invocations
    Cancel,
}

pub struct ScanEngine {
    cfg: Arc<RunConfig>,
}

impl ScanEngine {
    pub fn new(cfg: RunConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<RunEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<RunReport> {
        let cfg = self.cfg;
        let layout = RunLayout::new(&cfg.output_dir);
        layout.ensure_fresh()?;
        std::fs::create_dir_all(layout.root())
            .with_context(|| format!("create {}", layout.root().display()))?;

        // Nothing marks the directory as used until partitioning succeeds.
        let source = cfg.source.clone();
        let size = cfg.partition_size;
        let target = layout.partitions_dir();
        let target_existed = target.exists();
        let partitioned = tokio::task::spawn_blocking(move || {
            partition::partition_source(&source, size, &target)
        })
        .await
        .context("partitioner task failed")?;
        let partitions = match partitioned {
            Ok(p) => p,
            Err(e) => {
                if !target_existed {
                    let _ = std::fs::remove_dir_all(layout.partitions_dir());
                }
                return Err(e.into());
            }
        };

        layout.create_dirs()?;
        storage::save_config(&layout, &cfg)?;

        let store = TaskStore::open(layout.status_dir()).map_err(RunError::from)?;
        for p in &partitions {
            store.create_pending(&p.id, p.item_count).map_err(RunError::from)?;
        }
        let total = partitions.len();
        let items_total: u64 = partitions.iter().map(|p| p.item_count).sum();
        info!(
            partitions = total,
            items = items_total,
            status_dir = %store.dir().display(),
            "registered partitions"
        );
        let _ = event_tx.send(RunEvent::Partitioned {
            partitions: total,
            items: items_total,
        });

        let paused = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        // Control listener.
        let paused2 = paused.clone();
        let cancel2 = cancel.clone();
        let strategy = cfg.strategy;
        let control_events = event_tx.clone();
        let control_handle = tokio::spawn(async move {
            while let Some(msg) = control_rx.recv().await {
                match msg {
                    EngineControl::Pause(p) if strategy == Strategy::External => {
                        let _ = control_events.send(RunEvent::Info(InfoEvent::Message(format!(
                            "{} is not supported by the external strategy",
                            if p { "Pause" } else { "Resume" }
                        ))));
                    }
                    EngineControl::Pause(p) => {
                        paused2.store(p, Ordering::Relaxed);
                        info!(paused = p, "dispatch");
                        let _ = control_events.send(RunEvent::Info(InfoEvent::Paused(p)));
                    }
                    EngineControl::Cancel => {
                        cancel2.cancel();
                        break;
                    }
                }
            }
        });

        let started = Instant::now();
        let stop_aggregator = CancellationToken::new();
        let aggregator = Aggregator {
            store: store.clone(),
            total,
            items_total,
            interval: cfg.refresh_interval,
            started,
        };
        let aggregator_handle =
            tokio::spawn(aggregator.run(event_tx.clone(), stop_aggregator.clone()));

        let ctx = WorkerContext {
            cfg: cfg.clone(),
            layout,
            store: store.clone(),
        };
        let dispatched = match cfg.strategy {
            Strategy::Pool => pool::run_pool(&ctx, partitions, &event_tx, paused, &cancel).await,
            Strategy::External => {
                external::run_external(&ctx, &partitions, &event_tx, &cancel).await
            }
        };

        // Dropping a JoinHandle does not stop the task; abort the listener explicitly.
        control_handle.abort();
        stop_aggregator.cancel();
        let _ = aggregator_handle.await;

        reconcile(&store, &event_tx);
        dispatched?;

        let records = store.read_all();
        let snapshot = aggregator::snapshot_from(&records, total, items_total, started.elapsed());
        let _ = event_tx.send(RunEvent::Snapshot(Arc::new(snapshot)));

        let report = report::build_report(&cfg, &records, total, cancel.is_cancelled());
        info!(
            completed = report.completed,
            failed = report.failed,
            pending = report.pending,
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }
}

const STALE_REASON: &str = "scheduler stopped while the task was processing";

/// Fail whatever is still `Processing` once the scheduler has drained.
fn reconcile(store: &TaskStore, event_tx: &mpsc::UnboundedSender<RunEvent>) {
    let stale = store.reconcile_stale(STALE_REASON);
    if stale.is_empty() {
        return;
    }
    warn!(tasks = ?stale, "reconciled stale tasks");
    let count = stale.len();
    for partition_id in stale {
        let _ = event_tx.send(RunEvent::TaskChanged {
            partition_id,
            state: TaskState::Failed,
            detail: Some(format!("{}: {STALE_REASON}", FailureKind::ForcedCancellation)),
        });
    }
    let _ = event_tx.send(RunEvent::Info(InfoEvent::Reconciled { count }));
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
