use crate::context::TaskContext;
use crate::EngineError;
use overlord_state::{Document, StateError};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a handler reports when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    /// Still in progress; the task keeps its status and is re-polled later,
    /// possibly by a future process.
    Pending { repoll_after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Transient failure. `after` overrides the backoff delay.
    Retry {
        reason: String,
        after: Option<Duration>,
    },
    Fatal(String),
    /// The handler observed its cancellation token and stopped.
    Cancelled,
}

impl TaskError {
    pub fn retry(reason: impl Into<String>) -> Self {
        TaskError::Retry {
            reason: reason.into(),
            after: None,
        }
    }

    pub fn retry_after(reason: impl Into<String>, after: Duration) -> Self {
        TaskError::Retry {
            reason: reason.into(),
            after: Some(after),
        }
    }

    pub fn fatal(reason: impl fmt::Display) -> Self {
        TaskError::Fatal(reason.to_string())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Retry { reason, .. } => write!(f, "{reason} (will retry)"),
            TaskError::Fatal(reason) => f.write_str(reason),
            TaskError::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<StateError> for TaskError {
    fn from(e: StateError) -> Self {
        TaskError::Fatal(e.to_string())
    }
}

pub type HandlerResult = Result<Outcome, TaskError>;

pub(crate) type HandlerFn = Arc<dyn Fn(&mut TaskContext<'_>) -> HandlerResult + Send + Sync>;

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub(crate) do_fn: HandlerFn,
    pub(crate) undo_fn: Option<HandlerFn>,
    pub(crate) cleanup_fn: Option<HandlerFn>,
}

/// Which handler of a kind to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Do,
    Undo,
    Cleanup,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Do => f.write_str("do"),
            Direction::Undo => f.write_str("undo"),
            Direction::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// Maps task kinds to their handlers.
///
/// A kind registered without an undo handler is not revertible.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    entries: BTreeMap<String, HandlerEntry>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<D, U>(&mut self, kind: &str, do_fn: D, undo_fn: U) -> Result<(), EngineError>
    where
        D: Fn(&mut TaskContext<'_>) -> HandlerResult + Send + Sync + 'static,
        U: Fn(&mut TaskContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(kind, Arc::new(do_fn), Some(Arc::new(undo_fn)))
    }

    pub fn register_irreversible<D>(&mut self, kind: &str, do_fn: D) -> Result<(), EngineError>
    where
        D: Fn(&mut TaskContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(kind, Arc::new(do_fn), None)
    }

    /// Attach a cleanup handler, run once the task's change is ready.
    pub fn register_cleanup<C>(&mut self, kind: &str, cleanup_fn: C) -> Result<(), EngineError>
    where
        C: Fn(&mut TaskContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        let entry = self
            .entries
            .get_mut(kind)
            .ok_or_else(|| EngineError::UnknownKinds(vec![kind.to_owned()]))?;
        entry.cleanup_fn = Some(Arc::new(cleanup_fn));
        Ok(())
    }

    fn insert(
        &mut self,
        kind: &str,
        do_fn: HandlerFn,
        undo_fn: Option<HandlerFn>,
    ) -> Result<(), EngineError> {
        if self.entries.contains_key(kind) {
            return Err(EngineError::DuplicateHandler(kind.to_owned()));
        }
        self.entries.insert(
            kind.to_owned(),
            HandlerEntry {
                do_fn,
                undo_fn,
                cleanup_fn: None,
            },
        );
        Ok(())
    }

    pub fn is_known(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn is_revertible(&self, kind: &str) -> bool {
        self.entries.get(kind).is_some_and(|e| e.undo_fn.is_some())
    }

    pub fn has_cleanup(&self, kind: &str) -> bool {
        self.entries.get(kind).is_some_and(|e| e.cleanup_fn.is_some())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Fail if any unfinished task in `doc` has a kind nobody handles.
    pub fn validate(&self, doc: &Document) -> Result<(), EngineError> {
        let unknown: BTreeSet<String> = doc
            .tasks()
            .filter(|t| !t.status().is_ready() && !self.is_known(t.kind()))
            .map(|t| t.kind().to_owned())
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(EngineError::UnknownKinds(unknown.into_iter().collect()))
        }
    }

    pub(crate) fn handler(&self, kind: &str, direction: Direction) -> Option<HandlerFn> {
        let entry = self.entries.get(kind)?;
        match direction {
            Direction::Do => Some(Arc::clone(&entry.do_fn)),
            Direction::Undo => entry.undo_fn.clone(),
            Direction::Cleanup => entry.cleanup_fn.clone(),
        }
    }
}
