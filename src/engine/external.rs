//! Fan-out delegated to an external parallel utility (`xargs -P` or GNU `parallel`).
//!
//! The utility is fed partition ids on stdin and runs this binary's hidden
//! `run-partition` subcommand once per id. Each of those processes claims,
//! executes and finishes its own record, so the parent only watches the store.

use super::shutdown_signal;
use super::worker::{self, signal_group, WorkerContext};
use crate::error::RunError;
use crate::model::{InfoEvent, ParallelTool, RunEvent, TaskState};
use crate::partition::Partition;
use crate::storage::{self, RunLayout};
use crate::store::TaskStore;
use anyhow::Result;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const RUN_PARTITION: &str = "run-partition";

/// Argument vector for the parallel utility, ending where the partition id goes.
pub fn fanout_args(
    tool: ParallelTool,
    concurrency: usize,
    exe: &Path,
    root: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = match tool {
        ParallelTool::Xargs => vec![
            "-P".into(),
            concurrency.to_string().into(),
            "-n".into(),
            "1".into(),
        ],
        ParallelTool::Parallel => vec![
            "-j".into(),
            concurrency.to_string().into(),
            "--will-cite".into(),
            "--line-buffer".into(),
        ],
    };
    args.push(exe.into());
    args.push(RUN_PARTITION.into());
    args.push("--output-dir".into());
    args.push(root.into());
    args.push("--partition".into());
    if tool == ParallelTool::Parallel {
        args.push("{}".into());
    }
    args
}

pub async fn run_external(
    ctx: &WorkerContext,
    partitions: &[Partition],
    event_tx: &UnboundedSender<RunEvent>,
    cancel: &CancellationToken,
) -> Result<(), RunError> {
    let tool = ctx.cfg.parallel_tool;
    let program = tool.program().to_string();
    let exe = std::env::current_exe()
        .map_err(|e| RunError::Configuration(format!("cannot locate own executable: {e}")))?;
    let fanout_log = ctx.layout.fanout_log();
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&fanout_log)
        .and_then(|f| Ok((f.try_clone()?, f)))
        .map_err(|e| {
            RunError::Configuration(format!("cannot open {}: {e}", fanout_log.display()))
        })?;

    let mut cmd = Command::new(&program);
    cmd.args(fanout_args(
        tool,
        ctx.cfg.concurrency,
        &exe,
        ctx.layout.root(),
    ))
    .stdin(Stdio::piped())
    .stdout(Stdio::from(log.0))
    .stderr(Stdio::from(log.1))
    .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    info!(tool = %program, partitions = partitions.len(), "starting external fan-out");
    let mut child = cmd.spawn().map_err(|source| RunError::Dispatch {
        program: program.clone(),
        source,
    })?;
    let pgid = child.id();

    if let Some(mut stdin) = child.stdin.take() {
        let ids: String = partitions.iter().map(|p| format!("{}\n", p.id)).collect();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(ids.as_bytes()).await {
                debug!("fan-out stdin closed early: {e}");
            }
        });
    }

    let mut seen: HashMap<String, TaskState> = partitions
        .iter()
        .map(|p| (p.id.clone(), TaskState::Pending))
        .collect();
    let mut tick = tokio::time::interval(ctx.cfg.reap_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let hard_kill = tokio::time::sleep(ctx.cfg.grace_period);
    tokio::pin!(hard_kill);
    let mut cancelling = false;
    let mut killed = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = tick.tick() => publish_changes(&ctx.store, &mut seen, event_tx).await,
            _ = cancel.cancelled(), if !cancelling => {
                cancelling = true;
                info!("cancelling external fan-out");
                let _ = event_tx.send(RunEvent::Info(InfoEvent::Cancelling));
                signal_group(pgid, false);
                hard_kill.as_mut().reset(Instant::now() + ctx.cfg.grace_period);
            }
            _ = &mut hard_kill, if cancelling && !killed => {
                killed = true;
                warn!(tool = %program, "fan-out ignored SIGTERM; killing");
                signal_group(pgid, true);
            }
        }
    };

    match status {
        Ok(s) if s.success() => debug!(tool = %program, "fan-out finished"),
        Ok(s) if !cancelling => warn!(
            "{}",
            RunError::Invocation(format!("{program} exited with {s}"))
        ),
        Ok(_) => {}
        Err(e) => warn!(tool = %program, "lost track of fan-out: {e}"),
    }

    if cancelling {
        drain(ctx, &mut seen, event_tx).await;
    }
    publish_changes(&ctx.store, &mut seen, event_tx).await;
    Ok(())
}

/// Give orphaned `run-partition` workers time to record their own cancellation.
async fn drain(
    ctx: &WorkerContext,
    seen: &mut HashMap<String, TaskState>,
    event_tx: &UnboundedSender<RunEvent>,
) {
    let deadline = Instant::now() + ctx.cfg.grace_period * 2 + Duration::from_secs(1);
    while Instant::now() < deadline {
        publish_changes(&ctx.store, seen, event_tx).await;
        if !seen.values().any(|s| *s == TaskState::Processing) {
            return;
        }
        tokio::time::sleep(ctx.cfg.reap_interval).await;
    }
    warn!("workers still processing after cancellation grace period");
}

async fn publish_changes(
    store: &TaskStore,
    seen: &mut HashMap<String, TaskState>,
    event_tx: &UnboundedSender<RunEvent>,
) {
    let store = store.clone();
    let records = tokio::task::spawn_blocking(move || store.read_all())
        .await
        .unwrap_or_default();
    for rec in records {
        let prev = seen.insert(rec.partition_id.clone(), rec.state);
        if prev == Some(rec.state) {
            continue;
        }
        let detail = rec.failure.map(|kind| match rec.error.as_deref() {
            Some(err) => format!("{kind}: {err}"),
            None => kind.to_string(),
        });
        let _ = event_tx.send(RunEvent::TaskChanged {
            partition_id: rec.partition_id,
            state: rec.state,
            detail,
        });
    }
}

/// Body of the hidden `run-partition` subcommand: one partition, start to finish.
pub async fn run_partition_command(output_dir: &Path, partition_id: &str) -> Result<()> {
    let layout = RunLayout::new(output_dir);
    let cfg = storage::load_config(&layout)?;
    let store = TaskStore::open(layout.status_dir())?;
    let rec = store.read(partition_id)?;
    let partition = Partition {
        id: partition_id.to_string(),
        path: layout.partition_file(partition_id),
        item_count: rec.items,
    };
    let ctx = WorkerContext {
        cfg: Arc::new(cfg),
        layout,
        store,
    };

    worker::claim(&ctx, &partition)?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let outcome = worker::execute(&ctx, &partition, &cancel).await;
    watcher.abort();
    let rec = worker::finish(&ctx, partition_id, outcome)?;
    info!(task = partition_id, state = %rec.state, "partition finished");
    Ok(())
}
