//! Output tree layout and the files written into it.

use crate::error::RunError;
use crate::model::{RunConfig, RunReport, TaskRecord};
use crate::partition;
use crate::store::record::format_time;
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where everything for one run lives, rooted at the output directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_file(&self) -> PathBuf {
        self.root.join("run.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("chunkscan.log")
    }

    pub fn fanout_log(&self) -> PathBuf {
        self.root.join("fanout.log")
    }

    pub fn partitions_dir(&self) -> PathBuf {
        self.root.join("partitions")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.root.join("status")
    }

    pub fn partition_file(&self, id: &str) -> PathBuf {
        self.partitions_dir().join(partition::file_name(id))
    }

    pub fn task_log(&self, id: &str) -> PathBuf {
        self.root.join("logs").join(format!("chunk_{id}.log"))
    }

    pub fn task_work_dir(&self, id: &str) -> PathBuf {
        self.root.join("work").join(format!("chunk_{id}"))
    }

    /// Final location of a partition's raw output. A directory in per-item mode.
    pub fn result_path(&self, id: &str, per_item: bool) -> PathBuf {
        let dir = self.root.join("results");
        if per_item {
            dir.join(format!("chunk_{id}"))
        } else {
            dir.join(format!("chunk_{id}.json"))
        }
    }

    pub fn report_json(&self) -> PathBuf {
        self.root.join("report.json")
    }

    pub fn report_text(&self) -> PathBuf {
        self.root.join("report.txt")
    }

    /// Refuse to reuse an output directory that already holds a run.
    pub fn ensure_fresh(&self) -> Result<(), RunError> {
        if self.run_file().exists() {
            return Err(RunError::Configuration(format!(
                "{} already contains a run; choose an empty output directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    pub fn create_dirs(&self) -> Result<(), RunError> {
        for dir in ["logs", "work", "results"] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).map_err(|e| {
                RunError::Configuration(format!("cannot create {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }
}

pub fn save_config(layout: &RunLayout, cfg: &RunConfig) -> Result<PathBuf> {
    let path = layout.run_file();
    let body = serde_json::to_string_pretty(cfg)?;
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

pub fn load_config(layout: &RunLayout) -> Result<RunConfig> {
    let path = layout.run_file();
    let body = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("parse {}", path.display()))
}

pub fn export_json(path: &Path, report: &RunReport) -> Result<()> {
    let body = serde_json::to_string_pretty(report)?;
    fs::write(path, body).with_context(|| format!("write {}", path.display()))
}

pub fn export_text(path: &Path, lines: &[String]) -> Result<()> {
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(path, body).with_context(|| format!("write {}", path.display()))
}

/// One row per task, in partition order.
pub fn export_csv(path: &Path, records: &[TaskRecord]) -> Result<()> {
    let mut f = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    writeln!(
        f,
        "partition,state,items,attempts,start_time,end_time,duration_secs,exit_code,failure,error,output"
    )?;
    for r in records {
        let cols = [
            r.partition_id.clone(),
            r.state.to_string(),
            r.items.to_string(),
            r.attempts.to_string(),
            r.start_time.map(format_time).unwrap_or_default(),
            r.end_time.map(format_time).unwrap_or_default(),
            r.duration()
                .map(|d| format!("{:.3}", d.as_secs_f64()))
                .unwrap_or_default(),
            r.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            r.failure.map(|k| k.to_string()).unwrap_or_default(),
            r.error.clone().unwrap_or_default(),
            r.raw_output_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ];
        let line: Vec<String> = cols.iter().map(|c| csv_escape(c)).collect();
        writeln!(f, "{}", line.join(","))?;
    }
    Ok(())
}

fn csv_escape(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
