use crate::concurrency::CancelToken;
use crate::handler::TaskError;
use overlord_state::{ChangeId, Document, LogLevel, State, StateError, StateGuard, Task, TaskId};
use serde::de::DeserializeOwned;
use serde::Serialize;

const LOCK_HELD: &str = "state lock is held whenever the context is reachable";

/// What a handler sees while it runs: its task, the state document (locked),
/// and the cancellation signal for its lane.
pub struct TaskContext<'a> {
    state: &'a State,
    guard: Option<StateGuard<'a>>,
    task: TaskId,
    change: ChangeId,
    cancel: CancelToken,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        state: &'a State,
        guard: StateGuard<'a>,
        task: TaskId,
        change: ChangeId,
        cancel: CancelToken,
    ) -> Self {
        Self {
            state,
            guard: Some(guard),
            task,
            change,
            cancel,
        }
    }

    pub(crate) fn into_guard(mut self) -> StateGuard<'a> {
        match self.guard.take() {
            Some(guard) => guard,
            None => self.state.lock(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn change_id(&self) -> ChangeId {
        self.change
    }

    pub fn state(&self) -> &'a State {
        self.state
    }

    pub fn doc(&self) -> &Document {
        self.guard.as_deref().expect(LOCK_HELD)
    }

    pub fn doc_mut(&mut self) -> &mut Document {
        self.guard.as_deref_mut().expect(LOCK_HELD)
    }

    pub fn task(&self) -> Result<&Task, StateError> {
        self.doc()
            .task(self.task)
            .ok_or(StateError::TaskNotFound(self.task))
    }

    pub fn task_mut(&mut self) -> Result<&mut Task, StateError> {
        let id = self.task;
        self.doc_mut()
            .task_mut(id)
            .ok_or(StateError::TaskNotFound(id))
    }

    /// Read a value from the task's data.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        self.task()?.get(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.task_mut()?.set(key, value)
    }

    pub fn logf(&mut self, level: LogLevel, msg: impl std::fmt::Display) {
        if let Ok(task) = self.task_mut() {
            task.logf(level, msg);
        }
    }

    pub fn set_progress(&mut self, label: &str, done: u64, total: u64) {
        if let Ok(task) = self.task_mut() {
            task.set_progress(label, done, total);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the runner asked this handler to stop.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Release the state lock (checkpointing pending mutations) until the
    /// returned guard is dropped.
    ///
    /// The guard borrows the context mutably, so the document cannot be
    /// touched and a second unlock cannot start while it is alive.
    pub fn unlock(&mut self) -> Unlocked<'_, 'a> {
        if let Some(guard) = self.guard.take() {
            drop(guard);
        }
        Unlocked { ctx: self }
    }

    /// Run `f` with the state lock released.
    pub fn without_lock<R>(&mut self, f: impl FnOnce(&Unlocked<'_, 'a>) -> R) -> R {
        let unlocked = self.unlock();
        f(&unlocked)
    }
}

/// Live while a handler runs without the state lock. Dropping it relocks.
pub struct Unlocked<'c, 'a> {
    ctx: &'c mut TaskContext<'a>,
}

impl Unlocked<'_, '_> {
    pub fn is_cancelled(&self) -> bool {
        self.ctx.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        self.ctx.check_cancelled()
    }

    pub fn task_id(&self) -> TaskId {
        self.ctx.task
    }
}

impl Drop for Unlocked<'_, '_> {
    fn drop(&mut self) {
        let state = self.ctx.state;
        self.ctx.guard = Some(state.lock());
    }
}
