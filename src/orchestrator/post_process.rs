//! Post-run processing: report files and exports.

use crate::model::{RunConfig, RunReport};
use crate::storage::{self, RunLayout};
use crate::store::TaskStore;
use crate::text_summary::{build_text_summary, TextSummary};
use std::path::Path;
use tracing::warn;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub summary: TextSummary,
    pub export_messages: Vec<String>,
}

/// Write `report.json`/`report.txt` into the output tree, plus the optional CSV export.
///
/// Failures here are reported as messages; the run itself already finished.
pub(crate) fn process_run_completion(
    cfg: &RunConfig,
    export_csv: Option<&Path>,
    report: &RunReport,
) -> ProcessedRun {
    let layout = RunLayout::new(&cfg.output_dir);
    let summary = build_text_summary(report);
    let mut export_messages = Vec::new();

    let json_path = layout.report_json();
    match storage::export_json(&json_path, report) {
        Ok(()) => export_messages.push(format!("Report: {}", json_path.display())),
        Err(e) => export_messages.push(format!("Writing report failed: {e:#}")),
    }
    if let Err(e) = storage::export_text(&layout.report_text(), &summary.lines) {
        export_messages.push(format!("Writing text report failed: {e:#}"));
    }

    if let Some(path) = export_csv {
        let records = TaskStore::open(layout.status_dir())
            .map(|store| store.read_all())
            .unwrap_or_else(|e| {
                warn!("cannot open task store for export: {e}");
                Vec::new()
            });
        match storage::export_csv(path, &records) {
            Ok(()) => export_messages.push(format!("Exported CSV: {}", path.display())),
            Err(e) => export_messages.push(format!("Export CSV failed: {e:#}")),
        }
    }

    ProcessedRun {
        summary,
        export_messages,
    }
}
