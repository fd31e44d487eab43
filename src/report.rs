//! Final run report. A pure function of the task records and the configuration.

use crate::metrics;
use crate::model::{FailedPartition, RunConfig, RunReport, TaskRecord, TaskState};
use crate::store::record::format_time;
use std::time::Duration;
use time::OffsetDateTime;

/// Build the report for `expected` partitions from whatever the store holds.
///
/// Expected partitions with no record count as unknown. `cancel_requested`
/// decides `cancelled`: partitions left pending by a fan-out that died on its
/// own do not make the run a cancelled one.
pub fn build_report(
    cfg: &RunConfig,
    records: &[TaskRecord],
    expected: usize,
    cancel_requested: bool,
) -> RunReport {
    let count = |state: TaskState| records.iter().filter(|r| r.state == state).count();
    let completed = count(TaskState::Completed);
    let failed = count(TaskState::Failed);
    let processing = count(TaskState::Processing);
    let pending = count(TaskState::Pending);
    let unknown = count(TaskState::Unknown) + expected.saturating_sub(records.len());

    let started = records.iter().filter_map(|r| r.start_time).min();
    let finished = records.iter().filter_map(|r| r.end_time).max();
    let elapsed = match (started, finished) {
        (Some(s), Some(f)) => Duration::try_from(f - s).unwrap_or_default(),
        _ => Duration::ZERO,
    };

    let durations: Vec<Duration> = records
        .iter()
        .filter(|r| r.state.is_terminal())
        .filter_map(|r| r.duration())
        .collect();

    let failures: Vec<FailedPartition> = records
        .iter()
        .filter(|r| r.state == TaskState::Failed)
        .map(|r| FailedPartition {
            partition_id: r.partition_id.clone(),
            failure: r.failure,
            detail: r.error.clone().unwrap_or_else(|| "no detail recorded".into()),
            attempts: r.attempts,
        })
        .collect();

    RunReport {
        generated_utc: format_time(OffsetDateTime::now_utc()),
        source: cfg.source.clone(),
        output_dir: cfg.output_dir.clone(),
        source_items: records.iter().map(|r| r.items).sum(),
        partition_size: cfg.partition_size,
        concurrency: cfg.concurrency,
        strategy: cfg.strategy,
        partitions: expected.max(records.len()),
        started_utc: started.map(format_time),
        finished_utc: finished.map(format_time),
        elapsed_seconds: elapsed.as_secs_f64(),
        completed,
        failed,
        processing,
        pending,
        unknown,
        cancelled: cancel_requested,
        throughput_per_minute: metrics::throughput_per_minute(completed, elapsed),
        durations: metrics::duration_summary(&durations),
        failures,
    }
}
