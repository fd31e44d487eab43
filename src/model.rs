use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub partition_size: usize,
    pub concurrency: usize,
    /// Per-invocation concurrency handed to the engine (`{threads}`).
    pub threads: u32,
    pub target_pattern: String,
    #[serde(default)]
    pub wordlist: Option<PathBuf>,
    pub engine: String,
    /// Argument templates; empty means the built-in defaults for the mode.
    #[serde(default)]
    pub engine_args: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    pub max_retries: u32,
    pub strategy: Strategy,
    pub parallel_tool: ParallelTool,
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    pub verbose: bool,
}

impl RunConfig {
    /// One invocation per item when a shared wordlist is in play.
    pub fn per_item(&self) -> bool {
        self.wordlist.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Slot pool managed in-process by a fixed-interval reap loop.
    Pool,
    /// Fan-out delegated to an external parallel-execution utility.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ParallelTool {
    Xargs,
    Parallel,
}

impl ParallelTool {
    pub fn program(self) -> &'static str {
        match self {
            ParallelTool::Xargs => "xargs",
            ParallelTool::Parallel => "parallel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Record missing or unreadable. Never written, only observed.
    Unknown,
}

impl TaskState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn can_transition_to(self, target: TaskState) -> bool {
        match self {
            TaskState::Pending => target == TaskState::Processing,
            TaskState::Processing => matches!(target, TaskState::Completed | TaskState::Failed),
            TaskState::Completed | TaskState::Failed | TaskState::Unknown => false,
        }
    }

    pub const fn as_label(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "processing" => Ok(TaskState::Processing),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            other => Err(format!("unknown state `{other}`")),
        }
    }
}

/// Why a task ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Exit,
    Timeout,
    Launch,
    MissingOutput,
    Cancelled,
    ForcedCancellation,
}

impl FailureKind {
    pub const fn as_label(self) -> &'static str {
        match self {
            FailureKind::Exit => "exit",
            FailureKind::Timeout => "timeout",
            FailureKind::Launch => "launch",
            FailureKind::MissingOutput => "missing-output",
            FailureKind::Cancelled => "cancelled",
            FailureKind::ForcedCancellation => "forced-cancellation",
        }
    }

    pub const fn is_cancellation(self) -> bool {
        matches!(
            self,
            FailureKind::Cancelled | FailureKind::ForcedCancellation
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exit" => Ok(FailureKind::Exit),
            "timeout" => Ok(FailureKind::Timeout),
            "launch" => Ok(FailureKind::Launch),
            "missing-output" => Ok(FailureKind::MissingOutput),
            "cancelled" => Ok(FailureKind::Cancelled),
            "forced-cancellation" => Ok(FailureKind::ForcedCancellation),
            other => Err(format!("unknown failure kind `{other}`")),
        }
    }
}

/// One partition's lifecycle record as held by the task store.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub partition_id: String,
    pub state: TaskState,
    pub items: u64,
    pub attempts: u32,
    /// Process id of the live invocation, if any.
    pub pid: Option<u32>,
    pub start_time: Option<OffsetDateTime>,
    pub end_time: Option<OffsetDateTime>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub log_path: Option<PathBuf>,
    pub raw_output_path: Option<PathBuf>,
}

impl TaskRecord {
    pub fn pending(partition_id: &str, items: u64) -> Self {
        Self {
            partition_id: partition_id.to_string(),
            state: TaskState::Pending,
            items,
            attempts: 0,
            pid: None,
            start_time: None,
            end_time: None,
            exit_code: None,
            failure: None,
            error: None,
            log_path: None,
            raw_output_path: None,
        }
    }

    /// Placeholder for a record that exists but could not be read.
    pub fn unknown(partition_id: &str) -> Self {
        Self {
            state: TaskState::Unknown,
            ..Self::pending(partition_id, 0)
        }
    }

    /// Wall time between start and end, for terminal records.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.start_time?, self.end_time?);
        Duration::try_from(end - start).ok()
    }
}

/// Extra fields supplied alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    pub attempts: Option<u32>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    pub error: Option<String>,
    pub log_path: Option<PathBuf>,
    pub raw_output_path: Option<PathBuf>,
}

impl TransitionDetail {
    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            failure: Some(kind),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Point-in-time aggregate view of every task. Each tick produces a fresh value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub processing: usize,
    pub pending: usize,
    pub unknown: usize,
    pub items_total: u64,
    pub items_completed: u64,
    pub elapsed_seconds: f64,
    pub throughput_per_minute: f64,
    /// `None` while throughput is zero.
    pub eta_minutes: Option<f64>,
}

impl RunSnapshot {
    pub fn terminal(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.processing == 0 && self.pending == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedPartition {
    pub partition_id: String,
    pub failure: Option<FailureKind>,
    pub detail: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurationSummary {
    pub mean_secs: f64,
    pub median_secs: f64,
    pub p25_secs: f64,
    pub p75_secs: f64,
    pub max_secs: f64,
}

/// Final run summary. Built only from task records plus the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_utc: String,
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub source_items: u64,
    pub partition_size: usize,
    pub concurrency: usize,
    pub strategy: Strategy,
    pub partitions: usize,
    #[serde(default)]
    pub started_utc: Option<String>,
    #[serde(default)]
    pub finished_utc: Option<String>,
    pub elapsed_seconds: f64,
    pub completed: usize,
    pub failed: usize,
    pub processing: usize,
    pub pending: usize,
    pub unknown: usize,
    pub cancelled: bool,
    pub throughput_per_minute: f64,
    #[serde(default)]
    pub durations: Option<DurationSummary>,
    pub failures: Vec<FailedPartition>,
}

#[derive(Debug, Clone)]
pub enum RunEvent {
    Partitioned {
        partitions: usize,
        items: u64,
    },
    TaskChanged {
        partition_id: String,
        state: TaskState,
        detail: Option<String>,
    },
    Snapshot(Arc<RunSnapshot>),
    Info(InfoEvent),
    RunCompleted {
        // Boxed to keep the event small on the channel.
        report: Box<RunReport>,
    },
}

/// Structured info events emitted by the engine and consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    Paused(bool),
    Cancelling,
    Reconciled { count: usize },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::Paused(true) => "Dispatch paused".to_string(),
            InfoEvent::Paused(false) => "Dispatch resumed".to_string(),
            InfoEvent::Cancelling => "Cancelling in-flight invocations…".to_string(),
            InfoEvent::Reconciled { count } => {
                format!("Marked {count} stale task(s) as forced-cancellation")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_transitions_are_legal() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Pending));
        for terminal in [Completed, Failed] {
            for target in [Pending, Processing, Completed, Failed, Unknown] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn unknown_is_not_parseable() {
        assert!("unknown".parse::<TaskState>().is_err());
        assert_eq!("failed".parse::<TaskState>(), Ok(TaskState::Failed));
    }

    #[test]
    fn failure_kind_labels_round_trip() {
        for kind in [
            FailureKind::Exit,
            FailureKind::Timeout,
            FailureKind::Launch,
            FailureKind::MissingOutput,
            FailureKind::Cancelled,
            FailureKind::ForcedCancellation,
        ] {
            assert_eq!(kind.as_label().parse::<FailureKind>(), Ok(kind));
        }
    }

    #[test]
    fn duration_requires_both_timestamps() {
        let mut rec = TaskRecord::pending("00", 3);
        assert!(rec.duration().is_none());
        let start = OffsetDateTime::UNIX_EPOCH;
        rec.start_time = Some(start);
        rec.end_time = Some(start + time::Duration::seconds(90));
        assert_eq!(rec.duration(), Some(Duration::from_secs(90)));
    }
}
