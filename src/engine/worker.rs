//! Executes one claimed partition against the scan engine.
//!
//! The worker owns its task record between `claim` and `finish`. Nothing
//! else writes to that record in the meantime.

use super::invocation::{self, Invocation};
use crate::error::{RunError, StoreError};
use crate::model::{FailureKind, RunConfig, TaskRecord, TaskState, TransitionDetail};
use crate::partition::Partition;
use crate::storage::RunLayout;
use crate::store::TaskStore;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_TAIL_BYTES: u64 = 4096;
const LOG_TAIL_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub cfg: Arc<RunConfig>,
    pub layout: RunLayout,
    pub store: TaskStore,
}

/// Terminal result of a partition, ready to be written to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        raw_output: PathBuf,
        attempts: u32,
    },
    Failed {
        kind: FailureKind,
        detail: String,
        exit_code: Option<i32>,
        attempts: u32,
    },
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Completed { .. } => TaskState::Completed,
            Outcome::Failed { .. } => TaskState::Failed,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Outcome::Completed { .. } => None,
            Outcome::Failed { kind, detail, .. } => Some(format!("{kind}: {detail}")),
        }
    }

    fn into_transition(self) -> TransitionDetail {
        match self {
            Outcome::Completed {
                raw_output,
                attempts,
            } => TransitionDetail {
                attempts: Some(attempts),
                exit_code: Some(0),
                raw_output_path: Some(raw_output),
                ..Default::default()
            },
            Outcome::Failed {
                kind,
                detail,
                exit_code,
                attempts,
            } => TransitionDetail {
                attempts: Some(attempts),
                exit_code,
                ..TransitionDetail::failed(kind, detail)
            },
        }
    }
}

/// Result of one attempt, before artifact promotion.
enum Attempt {
    Succeeded,
    Failed {
        kind: FailureKind,
        detail: String,
        exit_code: Option<i32>,
    },
}

impl Attempt {
    fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        Attempt::Failed {
            kind,
            detail: detail.into(),
            exit_code: None,
        }
    }
}

enum Stop {
    Timeout(Duration),
    Cancel,
}

/// `Pending -> Processing` for a partition about to be launched.
pub fn claim(ctx: &WorkerContext, partition: &Partition) -> Result<TaskRecord, StoreError> {
    let detail = TransitionDetail {
        log_path: Some(ctx.layout.task_log(&partition.id)),
        ..Default::default()
    };
    ctx.store
        .transition(&partition.id, TaskState::Processing, detail)
}

/// Write the terminal state for a finished partition.
pub fn finish(
    ctx: &WorkerContext,
    partition_id: &str,
    outcome: Outcome,
) -> Result<TaskRecord, StoreError> {
    let state = outcome.state();
    ctx.store
        .transition(partition_id, state, outcome.into_transition())
}

/// Run a claimed partition to a terminal outcome, retrying up to `max_retries` times.
pub async fn execute(
    ctx: &WorkerContext,
    partition: &Partition,
    cancel: &CancellationToken,
) -> Outcome {
    let id = partition.id.as_str();
    let work = ctx.layout.task_work_dir(id);
    let log_path = ctx.layout.task_log(id);
    let max_attempts = ctx.cfg.max_retries.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if attempt > 1 {
            info!(task = id, attempt, "retrying partition");
            let detail = TransitionDetail {
                attempts: Some(attempt),
                ..Default::default()
            };
            if let Err(e) = ctx.store.annotate(id, detail) {
                debug!(task = id, "cannot record attempt: {e}");
            }
        }

        if let Err(e) = reset_dir(&work).await {
            return Outcome::Failed {
                kind: FailureKind::Launch,
                detail: format!("cannot prepare {}: {e}", work.display()),
                exit_code: None,
                attempts: attempt,
            };
        }

        let result = if ctx.cfg.per_item() {
            run_items(ctx, partition, &log_path, cancel).await
        } else {
            run_whole(ctx, partition, &log_path, cancel).await
        };

        match result {
            Attempt::Succeeded => {
                return match promote(ctx, partition).await {
                    Ok(raw_output) => Outcome::Completed {
                        raw_output,
                        attempts: attempt,
                    },
                    Err(e) => Outcome::Failed {
                        kind: FailureKind::MissingOutput,
                        detail: format!("cannot move output into results: {e}"),
                        exit_code: Some(0),
                        attempts: attempt,
                    },
                };
            }
            Attempt::Failed {
                kind,
                detail,
                exit_code,
            } => {
                let retryable = matches!(
                    kind,
                    FailureKind::Exit | FailureKind::Timeout | FailureKind::MissingOutput
                ) && !cancel.is_cancelled();
                if retryable && attempt < max_attempts {
                    warn!(task = id, attempt, "{kind}: {detail}");
                    continue;
                }
                return Outcome::Failed {
                    kind,
                    detail,
                    exit_code,
                    attempts: attempt,
                };
            }
        }
    }
}

async fn run_whole(
    ctx: &WorkerContext,
    partition: &Partition,
    log_path: &Path,
    cancel: &CancellationToken,
) -> Attempt {
    let inv = invocation::for_partition(&ctx.cfg, &ctx.layout, partition);
    match run_invocation(ctx, &partition.id, &inv, log_path, cancel).await {
        Attempt::Succeeded if !inv.output.exists() => Attempt::failed(
            FailureKind::MissingOutput,
            format!(
                "engine exited 0 but wrote no output at {}",
                inv.output.display()
            ),
        ),
        other => other,
    }
}

async fn run_items(
    ctx: &WorkerContext,
    partition: &Partition,
    log_path: &Path,
    cancel: &CancellationToken,
) -> Attempt {
    let body = match tokio::fs::read_to_string(&partition.path).await {
        Ok(b) => b,
        Err(e) => {
            return Attempt::failed(
                FailureKind::Launch,
                format!("cannot read {}: {e}", partition.path.display()),
            )
        }
    };

    for (index, item) in body.lines().enumerate() {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if cancel.is_cancelled() {
            return Attempt::failed(
                FailureKind::Cancelled,
                format!("cancelled before item {index}"),
            );
        }
        let inv = invocation::for_item(&ctx.cfg, &ctx.layout, partition, index, item);
        match run_invocation(ctx, &partition.id, &inv, log_path, cancel).await {
            Attempt::Succeeded if !inv.output.exists() => {
                return Attempt::failed(
                    FailureKind::MissingOutput,
                    format!("item {index} ({item}): engine exited 0 but wrote no output"),
                )
            }
            Attempt::Succeeded => {}
            Attempt::Failed {
                kind,
                detail,
                exit_code,
            } => {
                return Attempt::Failed {
                    kind,
                    detail: format!("item {index} ({item}): {detail}"),
                    exit_code,
                }
            }
        }
    }
    Attempt::Succeeded
}

async fn run_invocation(
    ctx: &WorkerContext,
    id: &str,
    inv: &Invocation,
    log_path: &Path,
    cancel: &CancellationToken,
) -> Attempt {
    if cancel.is_cancelled() {
        return Attempt::failed(FailureKind::Cancelled, "cancelled before launch");
    }

    let (stdout, stderr) = match open_log(log_path) {
        Ok(pair) => pair,
        Err(e) => {
            return Attempt::failed(
                FailureKind::Launch,
                format!("cannot open log {}: {e}", log_path.display()),
            )
        }
    };

    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args)
        .current_dir(&inv.cwd)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(task = id, program = %inv.program, args = ?inv.args, "launching engine");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(source) => {
            let err = RunError::Dispatch {
                program: inv.program.clone(),
                source,
            };
            warn!(task = id, "{err}");
            return Attempt::failed(FailureKind::Launch, err.to_string());
        }
    };

    if let Some(pid) = child.id() {
        let detail = TransitionDetail {
            pid: Some(pid),
            ..Default::default()
        };
        if let Err(e) = ctx.store.annotate(id, detail) {
            debug!(task = id, "cannot record pid: {e}");
        }
    }

    let limit = ctx.cfg.timeout;
    let deadline = async move {
        match limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    let stop = tokio::select! {
        status = child.wait() => {
            return match status {
                Ok(s) if s.success() => Attempt::Succeeded,
                Ok(s) => exit_failure(s, log_path),
                Err(e) => Attempt::failed(FailureKind::Exit, format!("lost track of engine: {e}")),
            };
        }
        _ = deadline => Stop::Timeout(limit.unwrap_or_default()),
        _ = cancel.cancelled() => Stop::Cancel,
    };

    let forced = terminate(&mut child, ctx.cfg.grace_period).await;
    match stop {
        Stop::Timeout(limit) => {
            let mut detail = format!("timed out after {}", humantime::format_duration(limit));
            if forced {
                detail.push_str(" (killed after grace period)");
            }
            Attempt::failed(FailureKind::Timeout, detail)
        }
        Stop::Cancel if forced => Attempt::failed(
            FailureKind::ForcedCancellation,
            "engine ignored SIGTERM and was killed",
        ),
        Stop::Cancel => Attempt::failed(FailureKind::Cancelled, "cancelled while running"),
    }
}

fn exit_failure(status: ExitStatus, log_path: &Path) -> Attempt {
    let mut detail = status.to_string();
    if let Some(tail) = log_tail(log_path) {
        detail.push_str(" | ");
        detail.push_str(&tail);
    }
    Attempt::Failed {
        kind: FailureKind::Exit,
        detail,
        exit_code: status.code(),
    }
}

/// SIGTERM the engine's process group, wait out the grace period, then SIGKILL.
///
/// Returns true when the hard kill was needed.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> bool {
    let pid = child.id();
    signal_group(pid, false);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return false;
    }
    warn!(?pid, "process ignored SIGTERM for {:?}; killing", grace);
    signal_group(pid, true);
    let _ = child.start_kill();
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(?pid, "process did not exit after SIGKILL");
    }
    true
}

#[cfg(unix)]
pub(crate) fn signal_group(pid: Option<u32>, hard: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let signal = if hard { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!(pid, "killpg {signal:?}: {e}");
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: Option<u32>, _hard: bool) {}

/// Move the attempt's artifact(s) from the work dir into `results/`.
async fn promote(ctx: &WorkerContext, partition: &Partition) -> std::io::Result<PathBuf> {
    let per_item = ctx.cfg.per_item();
    let work = ctx.layout.task_work_dir(&partition.id);
    let dest = ctx.layout.result_path(&partition.id, per_item);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if per_item {
        tokio::fs::rename(&work, &dest).await?;
    } else {
        tokio::fs::rename(work.join("output.json"), &dest).await?;
        let _ = tokio::fs::remove_dir_all(&work).await;
    }
    Ok(dest)
}

async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(dir).await
}

fn open_log(path: &Path) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let err = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(err)))
}

fn log_tail(path: &Path) -> Option<String> {
    let mut f = File::open(path).ok()?;
    let len = f.metadata().ok()?.len();
    f.seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES)))
        .ok()?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).ok()?;
    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join(" | ");
    (!tail.is_empty()).then_some(tail)
}
