use crate::model::{InfoEvent, RunEvent, RunReport, RunSnapshot, TaskState};
use crate::text_summary::build_text_summary;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

const MAX_SERIES: usize = 240;
const MAX_RECENT: usize = 200;

pub struct UiState {
    pub tab: usize,
    pub paused: bool,
    pub cancelling: bool,
    pub info: String,

    pub snapshot: Arc<RunSnapshot>,
    // Completions observed per refresh, for the sparkline.
    pub completion_series: Vec<u64>,
    pub rate_samples: Vec<f64>,
    last_terminal: usize,

    pub running: BTreeSet<String>,
    pub recent: VecDeque<String>,
    pub failures: Vec<(String, String)>,
    pub failures_scroll: usize,

    pub report: Option<RunReport>,
    pub summary_lines: Vec<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            paused: false,
            cancelling: false,
            info: String::new(),
            snapshot: Arc::new(RunSnapshot::default()),
            completion_series: Vec::new(),
            rate_samples: Vec::new(),
            last_terminal: 0,
            running: BTreeSet::new(),
            recent: VecDeque::new(),
            failures: Vec::new(),
            failures_scroll: 0,
            report: None,
            summary_lines: Vec::new(),
        }
    }
}

impl UiState {
    pub fn is_done(&self) -> bool {
        self.report.is_some()
    }

    fn push_recent(&mut self, line: String) {
        if self.recent.len() == MAX_RECENT {
            self.recent.pop_front();
        }
        self.recent.push_back(line);
    }

    pub fn apply_event(&mut self, ev: RunEvent) {
        match ev {
            RunEvent::Partitioned { partitions, items } => {
                self.info = format!("Partitioned {items} items into {partitions} partitions");
            }
            RunEvent::TaskChanged {
                partition_id,
                state,
                detail,
            } => match state {
                TaskState::Processing => {
                    self.push_recent(format!("▶ {partition_id} started"));
                    self.running.insert(partition_id);
                }
                TaskState::Completed => {
                    self.running.remove(&partition_id);
                    self.push_recent(format!("✓ {partition_id} completed"));
                }
                TaskState::Failed => {
                    self.running.remove(&partition_id);
                    let detail = detail.unwrap_or_else(|| "failed".into());
                    self.push_recent(format!("✗ {partition_id} {detail}"));
                    self.failures.push((partition_id, detail));
                }
                TaskState::Pending | TaskState::Unknown => {}
            },
            RunEvent::Snapshot(snap) => {
                let terminal = snap.terminal();
                self.completion_series
                    .push(terminal.saturating_sub(self.last_terminal) as u64);
                self.last_terminal = terminal;
                if snap.throughput_per_minute > 0.0 {
                    self.rate_samples.push(snap.throughput_per_minute);
                }
                trim_front(&mut self.completion_series, MAX_SERIES);
                trim_front(&mut self.rate_samples, MAX_SERIES);
                self.snapshot = snap;
            }
            RunEvent::Info(info) => {
                match info {
                    InfoEvent::Paused(p) => self.paused = p,
                    InfoEvent::Cancelling => self.cancelling = true,
                    _ => {}
                }
                self.info = info.to_message();
            }
            RunEvent::RunCompleted { report } => {
                self.running.clear();
                self.paused = false;
                self.summary_lines = build_text_summary(&report).lines;
                self.info = if report.cancelled {
                    "Run cancelled. Press q to exit.".into()
                } else {
                    "Run finished. Press q to exit.".into()
                };
                self.report = Some(*report);
            }
        }
    }
}

fn trim_front<T>(v: &mut Vec<T>, max: usize) {
    if v.len() > max {
        let excess = v.len() - max;
        v.drain(..excess);
    }
}
