//! Error taxonomy for a scan run.
//!
//! Only [`RunError::Configuration`] and [`RunError::Partition`] abort a run.
//! Everything else is isolated to the partition that produced it and ends up
//! as a `Failed` (or `Unknown`) task record.

use crate::model::TaskState;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Bad or missing required input. Fatal, raised before any dispatch.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Source unreadable, empty, or the partition directory unusable.
    #[error("partition error: {0}")]
    Partition(String),

    /// The engine could not be launched for one partition.
    #[error("could not launch `{program}`: {source}")]
    Dispatch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit, timeout, or missing artifact for one partition.
    #[error("invocation failed: {0}")]
    Invocation(String),

    /// A status record that could not be read or parsed.
    #[error("unreadable status record {path}: {reason}")]
    StoreCorruption { path: PathBuf, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunError {
    /// True for the two classes that abort the run before scheduling.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Configuration(_) | RunError::Partition(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} already exists")]
    AlreadyExists(String),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("task {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(id: &str, source: std::io::Error) -> Self {
        StoreError::Io {
            id: id.to_string(),
            source,
        }
    }
}
