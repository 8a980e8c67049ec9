//! Durable state for the overlord task engine.
//!
//! This crate owns the single persisted document that every engine component
//! shares: changes, their tasks, dependency edges, lanes and auxiliary data.
//! `State` is the explicit handle to it, `StateGuard` is the one way in, and
//! unlocking a guard after a mutation checkpoints the document atomically
//! through a `Backend` (file or memory).

pub mod backend;
pub mod change;
pub mod data;
pub mod document;
pub mod ids;
pub mod lock;
pub mod prune;
pub mod state;
pub mod status;
pub mod task;
pub mod taskset;

pub use backend::{Backend, FileBackend, MemoryBackend};
pub use change::{derive_status, Change};
pub use data::DataBag;
pub use document::Document;
pub use ids::{ChangeId, LaneId, TaskId};
pub use lock::StateLock;
pub use prune::{PruneOptions, PruneReport};
pub use state::{EnsureSignal, State, StateGuard};
pub use status::{validate_transition, Status};
pub use task::{LogLevel, Progress, Task, MAX_LOG_ENTRIES};
pub use taskset::TaskSet;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt state at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("no state entry for key {0:?}")]
    NoState(String),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("change not found: {0}")]
    ChangeNotFound(ChangeId),
    #[error("lane {0} was never allocated")]
    UnknownLane(LaneId),
    #[error("stale change: {0}")]
    StaleChange(String),
    #[error("task {task} cannot wait for {prerequisite}: dependency cycle")]
    Cycle { task: TaskId, prerequisite: TaskId },
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("state lock acquisition failed: {0}")]
    LockFailed(String),
}

impl StateError {
    pub fn is_no_state(&self) -> bool {
        matches!(self, StateError::NoState(_))
    }

    /// The caller planned against state that moved on and must recompute.
    pub fn is_stale(&self) -> bool {
        matches!(self, StateError::StaleChange(_))
    }
}
