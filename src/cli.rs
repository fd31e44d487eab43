use crate::engine::{external, invocation};
use crate::error::RunError;
use crate::model::{
    ParallelTool, RunConfig, RunEvent, RunReport, RunSnapshot, Strategy, TaskState,
};
use crate::orchestrator::{self, UiCommand};
use crate::storage::RunLayout;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
///
/// Locks are taken per line: the tracing subscriber writes to stderr from
/// other threads and must never wait on this writer.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let mut out = stdout.lock();
                    let _ = writeln!(out, "{}", msg);
                    let _ = out.flush();
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(stderr.lock(), "{}", msg);
                }
            }
        }
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "chunkscan",
    version,
    about = "Split a large target list into partitions and scan them in parallel",
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Newline-delimited input file (one target per line)
    #[arg(required = true)]
    pub source: Option<PathBuf>,

    /// Directory that receives partitions, status records, logs and results
    #[arg(required = true)]
    pub output_directory: Option<PathBuf>,

    /// Items per partition
    #[arg(long, default_value_t = 10_000)]
    pub partition_size: usize,

    /// Maximum number of concurrent engine invocations
    #[arg(long, default_value_t = 5)]
    pub concurrency: usize,

    /// Per-invocation thread count handed to the engine as {threads}
    #[arg(long, default_value_t = 30)]
    pub threads: u32,

    /// Target template; {item} is replaced by the engine's item keyword or the item itself
    #[arg(long)]
    pub target_pattern: Option<String>,

    /// Shared wordlist; switches to one invocation per item
    #[arg(long)]
    pub wordlist: Option<PathBuf>,

    /// Scan engine executable
    #[arg(long, default_value = "ffuf")]
    pub engine: String,

    /// Replace the default engine arguments (repeatable; supports {input} {output} {target} {item} {threads} {wordlist})
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_arg: Vec<String>,

    /// Use --dashboard true or --dashboard false to override terminal detection
    #[arg(long, action = clap::ArgAction::Set)]
    pub dashboard: Option<bool>,

    /// How often the aggregator publishes a snapshot
    #[arg(long, default_value = "2s")]
    pub refresh_interval: humantime::Duration,

    /// Per-invocation timeout (none by default)
    #[arg(long)]
    pub timeout: Option<humantime::Duration>,

    /// Time between SIGTERM and SIGKILL when stopping an invocation
    #[arg(long, default_value = "5s")]
    pub grace_period: humantime::Duration,

    /// Extra attempts for a failed invocation before the partition is marked failed
    #[arg(long, default_value_t = 0)]
    pub max_retries: u32,

    /// Dispatch strategy
    #[arg(long, value_enum, default_value_t = Strategy::Pool)]
    pub strategy: Strategy,

    /// Fan-out utility used by the external strategy
    #[arg(long, value_enum, default_value_t = ParallelTool::Xargs)]
    pub parallel_tool: ParallelTool,

    /// Slot reap interval of the pool strategy
    #[arg(long, default_value = "250ms")]
    pub reap_interval: humantime::Duration,

    /// Print the final report as JSON on stdout (no dashboard)
    #[arg(long)]
    pub json: bool,

    /// Suppress all output except errors
    #[arg(long)]
    pub silent: bool,

    /// Export one row per partition as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Execute one registered partition of an existing run (used by the external strategy)
    #[command(name = external::RUN_PARTITION, hide = true)]
    RunPartition {
        #[arg(long)]
        output_dir: PathBuf,
        #[arg(long)]
        partition: String,
    },
}

/// How a run ended, for the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every partition reached a terminal state (failures included).
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn from_report(report: &RunReport) -> Self {
        if report.cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        }
    }
}

pub async fn run(args: Cli) -> Result<RunStatus> {
    if let Some(Command::RunPartition {
        output_dir,
        partition,
    }) = &args.command
    {
        crate::logging::init(args.verbose, None)?;
        external::run_partition_command(output_dir, partition).await?;
        return Ok(RunStatus::Completed);
    }

    let cfg = build_config(&args)?;

    if use_dashboard(&args) {
        #[cfg(feature = "tui")]
        {
            let layout = RunLayout::new(&cfg.output_dir);
            std::fs::create_dir_all(layout.root())
                .with_context(|| format!("create {}", layout.root().display()))?;
            crate::logging::init(cfg.verbose, Some(&layout.log_file()))?;
            warn_missing_engine(&cfg);
            return crate::tui::run(args, cfg).await;
        }
    }

    crate::logging::init(cfg.verbose, None)?;
    warn_missing_engine(&cfg);
    run_headless(&args, cfg).await
}

fn use_dashboard(args: &Cli) -> bool {
    if args.json || args.silent {
        return false;
    }
    cfg!(feature = "tui")
        && args
            .dashboard
            .unwrap_or_else(|| std::io::stdout().is_terminal())
}

fn warn_missing_engine(cfg: &RunConfig) {
    if which::which(&cfg.engine).is_err() {
        warn!(
            engine = %cfg.engine,
            "engine not found on PATH; every partition will fail to launch"
        );
    }
}

fn required_path(value: &Option<PathBuf>, name: &str) -> Result<PathBuf, RunError> {
    value
        .clone()
        .ok_or_else(|| RunError::Configuration(format!("missing <{name}>")))
}

fn absolute(path: &Path) -> Result<PathBuf, RunError> {
    std::path::absolute(path)
        .map_err(|e| RunError::Configuration(format!("cannot resolve {}: {e}", path.display())))
}

fn non_zero(value: Duration, flag: &str) -> Result<Duration, RunError> {
    if value.is_zero() {
        return Err(RunError::Configuration(format!("{flag} must be greater than zero")));
    }
    Ok(value)
}

/// Validate CLI arguments and resolve them into a `RunConfig`.
///
/// Every check here runs before anything is written to the output directory.
pub fn build_config(args: &Cli) -> Result<RunConfig, RunError> {
    let source = absolute(&required_path(&args.source, "SOURCE")?)?;
    let output_dir = absolute(&required_path(&args.output_directory, "OUTPUT_DIRECTORY")?)?;

    if !source.is_file() {
        return Err(RunError::Configuration(format!(
            "source {} is not a readable file",
            source.display()
        )));
    }
    if args.partition_size == 0 {
        return Err(RunError::Configuration(
            "--partition-size must be greater than zero".into(),
        ));
    }
    if args.concurrency == 0 {
        return Err(RunError::Configuration(
            "--concurrency must be greater than zero".into(),
        ));
    }
    if args.threads == 0 {
        return Err(RunError::Configuration(
            "--threads must be greater than zero".into(),
        ));
    }
    let refresh_interval = non_zero(args.refresh_interval.into(), "--refresh-interval")?;
    let reap_interval = non_zero(args.reap_interval.into(), "--reap-interval")?;
    let timeout = args
        .timeout
        .map(|t| non_zero(t.into(), "--timeout"))
        .transpose()?;

    let wordlist = match &args.wordlist {
        Some(w) => {
            let w = absolute(w)?;
            if !w.is_file() {
                return Err(RunError::Configuration(format!(
                    "wordlist {} is not a readable file",
                    w.display()
                )));
            }
            Some(w)
        }
        None => None,
    };
    let per_item = wordlist.is_some();

    let target_pattern = args
        .target_pattern
        .clone()
        .unwrap_or_else(|| invocation::default_target_pattern(per_item).to_string());
    if !target_pattern.contains("{item}") {
        return Err(RunError::Configuration(format!(
            "--target-pattern `{target_pattern}` must contain {{item}}"
        )));
    }

    if !args.engine_arg.is_empty() {
        let missing = invocation::missing_placeholders(&args.engine_arg, per_item);
        if !missing.is_empty() {
            return Err(RunError::Configuration(format!(
                "--engine-arg templates must reference {}",
                missing.join(", ")
            )));
        }
    }

    if args.strategy == Strategy::External {
        let tool = args.parallel_tool.program();
        which::which(tool).map_err(|_| {
            RunError::Configuration(format!(
                "--strategy external needs `{tool}` on PATH"
            ))
        })?;
    }

    RunLayout::new(&output_dir).ensure_fresh()?;

    Ok(RunConfig {
        source,
        output_dir,
        partition_size: args.partition_size,
        concurrency: args.concurrency,
        threads: args.threads,
        target_pattern,
        wordlist,
        engine: args.engine.clone(),
        engine_args: args.engine_arg.clone(),
        refresh_interval,
        timeout,
        grace_period: args.grace_period.into(),
        max_retries: args.max_retries,
        strategy: args.strategy,
        parallel_tool: args.parallel_tool,
        reap_interval,
        verbose: args.verbose,
    })
}

/// One stderr line for an event, or `None` for events headless mode stays quiet about.
fn describe_event(ev: &RunEvent) -> Option<String> {
    match ev {
        RunEvent::Partitioned { partitions, items } => Some(format!(
            "Partitioned {items} items into {partitions} partitions"
        )),
        RunEvent::TaskChanged {
            partition_id,
            state: TaskState::Failed,
            detail,
        } => Some(format!(
            "Partition {partition_id} failed: {}",
            detail.as_deref().unwrap_or("unknown error")
        )),
        RunEvent::TaskChanged { .. } => None,
        RunEvent::Snapshot(snap) => Some(progress_line(snap)),
        RunEvent::Info(info) => Some(info.to_message()),
        RunEvent::RunCompleted { .. } => None,
    }
}

fn progress_line(snap: &RunSnapshot) -> String {
    let eta = match snap.eta_minutes {
        Some(m) => humantime::format_duration(Duration::from_secs((m * 60.0).round() as u64))
            .to_string(),
        None => "-".into(),
    };
    format!(
        "[{}/{}] completed {}, failed {}, processing {}, pending {} ({:.2}/min, ETA {eta})",
        snap.terminal(),
        snap.total,
        snap.completed,
        snap.failed,
        snap.processing,
        snap.pending,
        snap.throughput_per_minute,
    )
}

async fn run_headless(args: &Cli, cfg: RunConfig) -> Result<RunStatus> {
    let quiet = args.json || args.silent;
    let (out_tx, out_handle) = spawn_output_writer();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RunEvent>();
    // Held until the run ends: a closed command channel means "cancel".
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let controller_cfg = cfg.clone();
    let mut handle = tokio::spawn(async move {
        orchestrator::run_controller(controller_cfg, event_tx, cmd_rx).await
    });

    let emit = |ev: RunEvent| {
        if quiet {
            return;
        }
        if let Some(line) = describe_event(&ev) {
            let _ = out_tx.send(OutputLine::Stderr(line));
        }
    };

    let joined = loop {
        tokio::select! {
            biased;
            ev = event_rx.recv() => match ev {
                Some(ev) => emit(ev),
                None => break (&mut handle).await,
            },
            joined = &mut handle => break joined,
        }
    };
    while let Ok(ev) = event_rx.try_recv() {
        emit(ev);
    }
    drop(cmd_tx);

    let report = joined.context("run controller task failed")??;
    let processed = orchestrator::process_run_completion(&cfg, args.export_csv.as_deref(), &report);

    if args.json {
        let out = serde_json::to_string_pretty(&report)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else if !args.silent {
        for line in processed.summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    if !args.silent {
        for msg in processed.export_messages {
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(RunStatus::from_report(&report))
}
