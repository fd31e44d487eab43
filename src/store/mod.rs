//! Durable, file-addressable task store.
//!
//! One status record per partition under a single directory. Every write is
//! an atomic replace (write to a temp file, fsync, rename), so a reader in
//! this or any other process sees either the old record or the new one.
//! Readers never take a lock; a record that fails to parse reads as
//! [`TaskState::Unknown`].

pub mod record;

use crate::error::{RunError, StoreError};
use crate::model::{FailureKind, TaskRecord, TaskState, TransitionDetail};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tracing::{debug, warn};

const RECORD_EXT: &str = "status";
const TRANSITION_LOG: &str = "transitions.log";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("<store>", e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXT}"))
    }

    pub fn transition_log_path(&self) -> PathBuf {
        self.dir.join(TRANSITION_LOG)
    }

    /// Register a partition as `Pending`. Fails if a record already exists.
    pub fn create_pending(&self, id: &str, items: u64) -> Result<TaskRecord, StoreError> {
        let rec = TaskRecord::pending(id, items);
        let tmp = self.write_temp(id, &record::encode(&rec))?;
        // hard_link refuses to clobber, which makes creation exclusive.
        let linked = fs::hard_link(&tmp, self.record_path(id));
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(id.to_string()))
            }
            Err(e) => return Err(StoreError::io(id, e)),
        }
        self.log_transition(id, None, TaskState::Pending, None);
        Ok(rec)
    }

    /// Move a task along the state machine, merging `detail` into the record.
    pub fn transition(
        &self,
        id: &str,
        to: TaskState,
        detail: TransitionDetail,
    ) -> Result<TaskRecord, StoreError> {
        let current = self.read_for_write(id)?;
        if !current.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.state,
                to,
            });
        }

        let from = current.state;
        let mut next = current;
        let now = OffsetDateTime::now_utc();
        next.state = to;
        match to {
            TaskState::Processing => {
                next.start_time = Some(now);
                next.attempts = next.attempts.max(1);
            }
            TaskState::Completed | TaskState::Failed => {
                next.end_time = Some(now);
                next.pid = None;
            }
            TaskState::Pending | TaskState::Unknown => {}
        }
        merge(&mut next, &detail);

        self.replace(&next)?;
        self.log_transition(id, Some(from), to, detail.error.as_deref());
        Ok(next)
    }

    /// Update a `Processing` record in place (pid, attempt counter) without a state change.
    pub fn annotate(&self, id: &str, detail: TransitionDetail) -> Result<TaskRecord, StoreError> {
        let mut rec = self.read_for_write(id)?;
        if rec.state != TaskState::Processing {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: rec.state,
                to: TaskState::Processing,
            });
        }
        merge(&mut rec, &detail);
        self.replace(&rec)?;
        Ok(rec)
    }

    pub fn read(&self, id: &str) -> Result<TaskRecord, RunError> {
        let path = self.record_path(id);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()).into())
            }
            Err(e) => {
                return Err(RunError::StoreCorruption {
                    path,
                    reason: e.to_string(),
                })
            }
        };
        record::decode(&text).map_err(|reason| RunError::StoreCorruption { path, reason })
    }

    /// Every record in the store, ordered by partition id.
    ///
    /// Not a transactional view: each record is read independently.
    pub fn read_all(&self) -> Vec<TaskRecord> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %self.dir.display(), "cannot list task store: {e}");
                return Vec::new();
            }
        };

        let mut out: Vec<TaskRecord> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                    return None;
                }
                let id = path.file_stem()?.to_str()?.to_string();
                if id.starts_with('.') {
                    return None;
                }
                Some(match self.read(&id) {
                    Ok(rec) => rec,
                    Err(e) => {
                        warn!("treating task {id} as unknown: {e}");
                        TaskRecord::unknown(&id)
                    }
                })
            })
            .collect();
        out.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        out
    }

    /// Fail every task still marked `Processing`. Returns the ids touched.
    pub fn reconcile_stale(&self, reason: &str) -> Vec<String> {
        let mut touched = Vec::new();
        for rec in self.read_all() {
            if rec.state != TaskState::Processing {
                continue;
            }
            let detail = TransitionDetail::failed(FailureKind::ForcedCancellation, reason);
            match self.transition(&rec.partition_id, TaskState::Failed, detail) {
                Ok(_) => touched.push(rec.partition_id),
                // Lost a race with the record's real owner finishing; fine.
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => warn!("could not reconcile task {}: {e}", rec.partition_id),
            }
        }
        touched
    }

    fn read_for_write(&self, id: &str) -> Result<TaskRecord, StoreError> {
        match self.read(id) {
            Ok(rec) => Ok(rec),
            Err(RunError::Store(e)) => Err(e),
            Err(e) => Err(StoreError::io(
                id,
                std::io::Error::new(ErrorKind::InvalidData, e.to_string()),
            )),
        }
    }

    fn replace(&self, rec: &TaskRecord) -> Result<(), StoreError> {
        let id = rec.partition_id.as_str();
        let tmp = self.write_temp(id, &record::encode(rec))?;
        fs::rename(&tmp, self.record_path(id)).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::io(id, e)
        })
    }

    fn write_temp(&self, id: &str, body: &str) -> Result<PathBuf, StoreError> {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!(".{id}.{}.{seq}.tmp", std::process::id()));
        let write = || -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(body.as_bytes())?;
            f.sync_all()
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::io(id, e)
        })?;
        Ok(tmp)
    }

    fn log_transition(&self, id: &str, from: Option<TaskState>, to: TaskState, err: Option<&str>) {
        let ts = record::format_time(OffsetDateTime::now_utc());
        let from = from.map(|s| s.as_label()).unwrap_or("-");
        let mut line = format!("{ts} {id} {from} -> {to}");
        if let Some(err) = err {
            line.push_str(" : ");
            line.push_str(&err.replace('\n', " "));
        }
        line.push('\n');
        debug!(task = id, %to, "transition");

        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transition_log_path())
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = appended {
            warn!("cannot append to transition log: {e}");
        }
    }
}

fn merge(rec: &mut TaskRecord, d: &TransitionDetail) {
    if let Some(v) = d.attempts {
        rec.attempts = v;
    }
    if d.pid.is_some() {
        rec.pid = d.pid;
    }
    if d.exit_code.is_some() {
        rec.exit_code = d.exit_code;
    }
    if d.failure.is_some() {
        rec.failure = d.failure;
    }
    if d.error.is_some() {
        rec.error = d.error.clone();
    }
    if d.log_path.is_some() {
        rec.log_path = d.log_path.clone();
    }
    if d.raw_output_path.is_some() {
        rec.raw_output_path = d.raw_output_path.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::open(tmp.path().join("status")).unwrap();
        (tmp, store)
    }

    #[test]
    fn create_twice_is_rejected() {
        let (_tmp, store) = store();
        store.create_pending("00", 10).unwrap();
        assert!(matches!(
            store.create_pending("00", 10),
            Err(StoreError::AlreadyExists(id)) if id == "00"
        ));
    }

    #[test]
    fn happy_path_sets_timestamps() {
        let (_tmp, store) = store();
        store.create_pending("00", 10).unwrap();

        let rec = store
            .transition("00", TaskState::Processing, TransitionDetail::default())
            .unwrap();
        assert_eq!(rec.state, TaskState::Processing);
        assert_eq!(rec.attempts, 1);
        assert!(rec.start_time.is_some());
        assert!(rec.end_time.is_none());

        let done = TransitionDetail {
            exit_code: Some(0),
            raw_output_path: Some(PathBuf::from("/r/chunk_00.json")),
            ..Default::default()
        };
        let rec = store.transition("00", TaskState::Completed, done).unwrap();
        assert!(rec.end_time.is_some());
        assert_eq!(store.read("00").unwrap(), rec);
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let (_tmp, store) = store();
        store.create_pending("00", 1).unwrap();
        assert!(matches!(
            store.transition("00", TaskState::Completed, TransitionDetail::default()),
            Err(StoreError::InvalidTransition { from: TaskState::Pending, .. })
        ));

        store
            .transition("00", TaskState::Processing, TransitionDetail::default())
            .unwrap();
        store
            .transition(
                "00",
                TaskState::Failed,
                TransitionDetail::failed(FailureKind::Exit, "exit status 1"),
            )
            .unwrap();
        for to in [TaskState::Processing, TaskState::Completed, TaskState::Failed] {
            assert!(store
                .transition("00", to, TransitionDetail::default())
                .is_err());
        }
        assert_eq!(store.read("00").unwrap().state, TaskState::Failed);

        assert!(matches!(
            store.transition("99", TaskState::Processing, TransitionDetail::default()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_record_reads_as_unknown() {
        let (_tmp, store) = store();
        store.create_pending("00", 1).unwrap();
        store.create_pending("01", 1).unwrap();
        fs::write(store.record_path("01"), "state=proc").unwrap();

        let all = store.read_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].state, TaskState::Pending);
        assert_eq!(all[1].state, TaskState::Unknown);
        assert!(matches!(
            store.read("01"),
            Err(RunError::StoreCorruption { .. })
        ));
    }

    #[test]
    fn writes_leave_no_temp_files_and_log_each_step() {
        let (_tmp, store) = store();
        store.create_pending("00", 1).unwrap();
        store
            .transition("00", TaskState::Processing, TransitionDetail::default())
            .unwrap();
        store
            .annotate(
                "00",
                TransitionDetail {
                    pid: Some(4242),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(store.read("00").unwrap().pid, Some(4242));

        let stray: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(stray.is_empty());

        let log = fs::read_to_string(store.transition_log_path()).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("00 - -> pending"));
        assert!(log.contains("00 pending -> processing"));
    }

    #[test]
    fn annotate_requires_processing() {
        let (_tmp, store) = store();
        store.create_pending("00", 1).unwrap();
        assert!(store.annotate("00", TransitionDetail::default()).is_err());
    }

    #[test]
    fn reconcile_fails_only_processing_tasks() {
        let (_tmp, store) = store();
        for id in ["00", "01", "02"] {
            store.create_pending(id, 1).unwrap();
        }
        store
            .transition("01", TaskState::Processing, TransitionDetail::default())
            .unwrap();

        let touched = store.reconcile_stale("shutdown");
        assert_eq!(touched, ["01"]);
        let rec = store.read("01").unwrap();
        assert_eq!(rec.state, TaskState::Failed);
        assert_eq!(rec.failure, Some(FailureKind::ForcedCancellation));
        assert_eq!(store.read("00").unwrap().state, TaskState::Pending);
    }
}
