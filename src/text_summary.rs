//! Text summary builder for CLI output and `report.txt`.

use crate::model::RunReport;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(report: &RunReport) -> TextSummary {
    let mut lines = Vec::new();

    let status = if report.cancelled {
        "cancelled"
    } else if report.failed > 0 || report.unknown > 0 || report.pending > 0 {
        "finished with failures"
    } else {
        "finished"
    };
    lines.push(format!("Run {status}: {}", report.output_dir.display()));
    lines.push(format!(
        "Source: {} ({} items in {} partitions of {}, concurrency {}, {:?} strategy)",
        report.source.display(),
        report.source_items,
        report.partitions,
        report.partition_size,
        report.concurrency,
        report.strategy,
    ));
    lines.push(format!(
        "Partitions: completed {} failed {} processing {} pending {} unknown {}",
        report.completed, report.failed, report.processing, report.pending, report.unknown
    ));
    if let (Some(start), Some(end)) = (&report.started_utc, &report.finished_utc) {
        lines.push(format!("Window: {start} .. {end}"));
    }
    lines.push(format!(
        "Elapsed: {} ({:.2} partitions/min)",
        humantime::format_duration(std::time::Duration::from_secs(
            report.elapsed_seconds.round() as u64
        )),
        report.throughput_per_minute
    ));
    if let Some(d) = report.durations.as_ref() {
        lines.push(format!(
            "Partition time: avg {:.1}s med {:.1}s p25 {:.1}s p75 {:.1}s max {:.1}s",
            d.mean_secs, d.median_secs, d.p25_secs, d.p75_secs, d.max_secs
        ));
    }

    if !report.failures.is_empty() {
        let by_cancel = report
            .failures
            .iter()
            .filter(|f| f.failure.is_some_and(|k| k.is_cancellation()))
            .count();
        if by_cancel > 0 {
            lines.push(format!(
                "Failed partitions ({}, {by_cancel} stopped by cancellation):",
                report.failures.len()
            ));
        } else {
            lines.push(format!("Failed partitions ({}):", report.failures.len()));
        }
        for f in &report.failures {
            let kind = f.failure.map(|k| k.as_label()).unwrap_or("failed");
            let retries = if f.attempts > 1 {
                format!(" after {} attempts", f.attempts)
            } else {
                String::new()
            };
            lines.push(format!(
                "  {} [{kind}]{retries}: {}",
                f.partition_id, f.detail
            ));
        }
    }

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailedPartition, FailureKind, Strategy};

    fn report() -> RunReport {
        RunReport {
            generated_utc: "2024-01-01T00:00:00Z".into(),
            source: "/in/list.txt".into(),
            output_dir: "/out".into(),
            source_items: 25,
            partition_size: 10,
            concurrency: 2,
            strategy: Strategy::Pool,
            partitions: 3,
            started_utc: None,
            finished_utc: None,
            elapsed_seconds: 61.4,
            completed: 2,
            failed: 1,
            processing: 0,
            pending: 0,
            unknown: 0,
            cancelled: false,
            throughput_per_minute: 1.95,
            durations: None,
            failures: vec![FailedPartition {
                partition_id: "01".into(),
                failure: Some(FailureKind::Exit),
                detail: "exit status: 1".into(),
                attempts: 2,
            }],
        }
    }

    #[test]
    fn failures_are_listed_with_kind() {
        let summary = build_text_summary(&report());
        assert_eq!(summary.lines[0], "Run finished with failures: /out");
        assert!(summary.lines.contains(
            &"Partitions: completed 2 failed 1 processing 0 pending 0 unknown 0".to_string()
        ));
        assert!(summary
            .lines
            .iter()
            .any(|l| l == "  01 [exit] after 2 attempts: exit status: 1"));
        assert!(summary.lines.iter().any(|l| l.starts_with("Elapsed: 1m 1s")));
        assert!(summary.lines.contains(&"Failed partitions (1):".to_string()));
    }

    #[test]
    fn leftover_pending_without_cancel_is_not_a_clean_finish() {
        let mut r = report();
        r.failed = 0;
        r.failures[0].failure = Some(FailureKind::ForcedCancellation);
        r.pending = 1;
        let summary = build_text_summary(&r);
        assert_eq!(summary.lines[0], "Run finished with failures: /out");
        assert!(summary
            .lines
            .contains(&"Failed partitions (1, 1 stopped by cancellation):".to_string()));
    }
}
