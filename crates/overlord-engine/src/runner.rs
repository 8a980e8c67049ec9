use crate::cascade::{plan_change_abort, plan_lane_abort, UndoPlan};
use crate::concurrency::CancelToken;
use crate::config::EngineConfig;
use crate::context::TaskContext;
use crate::handler::{Direction, HandlerRegistry, HandlerResult, Outcome, TaskError};
use crate::retry::RetryPolicy;
use crate::EngineError;
use chrono::{DateTime, Utc};
use overlord_state::{ChangeId, Document, LogLevel, PruneReport, State, Status, TaskId};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on status moves applied to a single task within one pass.
const MAX_MOVES_PER_PASS: usize = 4;

struct Running {
    direction: Direction,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

type RunningMap = HashMap<TaskId, Running>;

struct Shared {
    state: State,
    registry: HandlerRegistry,
    config: EngineConfig,
    retry: RetryPolicy,
    running: Mutex<RunningMap>,
    stuck_reported: Mutex<HashSet<TaskId>>,
    stopped: AtomicBool,
}

/// Summary of one ensure pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnsureReport {
    /// Handlers started by this pass.
    pub dispatched: usize,
    /// Status moves made without running a handler.
    pub transitions: usize,
    /// Handlers still running when the pass ended.
    pub running: usize,
    /// Ready tasks left for a later pass because of the dispatch cap.
    pub deferred: usize,
    /// Earliest retry or re-poll time of a task that is waiting on the clock.
    pub next_wakeup: Option<DateTime<Utc>>,
}

impl EnsureReport {
    /// Nothing ran, nothing moved and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0 && self.transitions == 0 && self.running == 0 && self.deferred == 0
    }
}

enum Step {
    Idle,
    Wake(DateTime<Utc>),
    Move(Status, String),
    Dispatch(Direction),
    Stuck(DateTime<Utc>),
}

/// Advances tasks through their lifecycle.
///
/// Each [`TaskRunner::ensure`] call is one scheduling pass over every pending
/// change. Handlers run on their own threads and signal the state's ensure
/// channel when they finish.
pub struct TaskRunner {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner").finish_non_exhaustive()
    }
}

impl TaskRunner {
    /// Fails if the config is invalid or an unfinished task has a kind the
    /// registry cannot handle.
    pub fn new(
        state: State,
        registry: HandlerRegistry,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        registry.validate(&state.lock())?;
        let retry = RetryPolicy::new(&config.retry);
        Ok(Self {
            shared: Arc::new(Shared {
                state,
                registry,
                config,
                retry,
                running: Mutex::new(HashMap::new()),
                stuck_reported: Mutex::new(HashSet::new()),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn state(&self) -> &State {
        &self.shared.state
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Tasks whose handler is currently executing.
    pub fn running(&self) -> Vec<(TaskId, Direction)> {
        let mut out: Vec<_> = self
            .shared
            .running()
            .iter()
            .map(|(id, r)| (*id, r.direction))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn is_running(&self, task: TaskId) -> bool {
        self.shared.running().contains_key(&task)
    }

    /// Persist an abort request for `change` and wake the loop.
    pub fn abort_change(&self, change: ChangeId) -> Result<(), EngineError> {
        let mut st = self.shared.state.lock();
        st.request_abort(change)?;
        st.unlock()?;
        self.shared.state.ensure_before(Duration::ZERO);
        Ok(())
    }

    /// One scheduling pass.
    pub fn ensure(&self) -> Result<EnsureReport, EngineError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        let shared = &self.shared;
        let now = Utc::now();
        let mut report = EnsureReport::default();
        let mut st = shared.state.lock();
        let mut running = shared.running();

        let requested: Vec<ChangeId> = st
            .changes()
            .filter(|c| c.abort_requested())
            .map(|c| c.id())
            .collect();
        for change in requested {
            let plan = plan_change_abort(&st, change, |k| shared.registry.is_revertible(k));
            if !plan.is_empty() {
                report.transitions += 1;
            }
            info!("aborting change {change}");
            shared.apply_plan(&mut st, &plan, &running, "change aborted");
            if let Some(chg) = st.change_mut(change) {
                chg.clear_abort_request();
            }
        }

        let pending = st.pending_changes();
        let ids: Vec<TaskId> = pending
            .iter()
            .filter_map(|c| st.change(*c))
            .flat_map(|c| c.task_ids().to_vec())
            .collect();
        for id in ids {
            for _ in 0..MAX_MOVES_PER_PASS {
                match shared.decide(&st, &running, id, now) {
                    Step::Idle => break,
                    Step::Wake(at) => {
                        report.next_wakeup = Some(report.next_wakeup.map_or(at, |w| w.min(at)));
                        break;
                    }
                    Step::Move(status, note) => {
                        shared.transition(&mut st, id, status, &note);
                        report.transitions += 1;
                    }
                    Step::Dispatch(direction) => {
                        if running.len() >= shared.config.max_concurrent {
                            report.deferred += 1;
                        } else {
                            self.dispatch(&mut st, &mut running, id, direction, now)?;
                            report.dispatched += 1;
                        }
                        break;
                    }
                    Step::Stuck(since) => {
                        shared.report_stuck(&mut st, id, since);
                        break;
                    }
                }
            }
        }

        let unclean: Vec<ChangeId> = st
            .changes()
            .map(|c| c.id())
            .filter(|c| st.change_is_ready(*c) && !st.change_is_clean(*c))
            .collect();
        for change in unclean {
            let tasks: Vec<(TaskId, bool, Option<DateTime<Utc>>)> = st
                .change_tasks(change)
                .iter()
                .filter(|t| !t.is_clean() && !running.contains_key(&t.id()))
                .map(|t| (t.id(), shared.registry.has_cleanup(t.kind()), t.at_time()))
                .collect();
            for (id, has_cleanup, at) in tasks {
                if !has_cleanup {
                    if let Some(t) = st.task_mut(id) {
                        t.set_clean();
                    }
                } else if let Some(at) = at.filter(|at| *at > now) {
                    report.next_wakeup = Some(report.next_wakeup.map_or(at, |w| w.min(at)));
                } else if running.len() >= shared.config.max_concurrent {
                    report.deferred += 1;
                } else {
                    self.dispatch(&mut st, &mut running, id, Direction::Cleanup, now)?;
                    report.dispatched += 1;
                }
            }
        }

        report.running = running.len();
        drop(running);
        st.unlock()?;
        if report.dispatched > 0 || report.transitions > 0 {
            debug!(
                "ensure: {} dispatched, {} moved, {} running",
                report.dispatched, report.transitions, report.running
            );
        }
        Ok(report)
    }

    fn dispatch(
        &self,
        doc: &mut Document,
        running: &mut RunningMap,
        id: TaskId,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(task) = doc.task(id) else {
            return Ok(());
        };
        let status = task.status();
        match (direction, status) {
            (Direction::Do, Status::Do) => doc.set_status(id, Status::Doing)?,
            (Direction::Undo, Status::Undo) => doc.set_status(id, Status::Undoing)?,
            _ => {}
        }
        if let Some(task) = doc.task_mut(id) {
            if direction == Direction::Do {
                task.note_attempt();
            }
            if direction != Direction::Cleanup {
                task.set_doing_since(Some(now));
            }
            task.set_at_time(None);
        }

        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || shared.execute(id, direction, worker_cancel))?;
        debug!("dispatched {direction} of task {id}");
        running.insert(
            id,
            Running {
                direction,
                cancel,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    /// Run ensure passes until no handler is running, nothing is ready and
    /// no retry is scheduled.
    pub fn settle(&self, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.ensure()?;
            if report.is_idle() && report.next_wakeup.is_none() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::SettleTimeout(timeout));
            }
            if report.transitions > 0 {
                continue;
            }
            let mut wait = deadline - now;
            if let Some(at) = report.next_wakeup {
                let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wait = wait.min(until);
            }
            self.shared.state.ensure_signal().wait(wait);
        }
    }

    /// Apply the configured pruning policy.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<PruneReport, EngineError> {
        let mut st = self.shared.state.lock();
        let report = st.prune(now, &self.shared.config.prune.options());
        st.unlock()?;
        if !report.aborted_changes.is_empty() {
            self.shared.state.ensure_before(Duration::ZERO);
        }
        Ok(report)
    }

    /// Cancel every running handler and wait for them to return. Further
    /// ensure passes fail with [`EngineError::Stopped`].
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = {
            let mut running = self.shared.running();
            let handles = running
                .values_mut()
                .filter_map(|r| {
                    r.cancel.cancel();
                    r.handle.take()
                })
                .collect();
            handles
        };
        if !handles.is_empty() {
            info!("waiting for {} running tasks", handles.len());
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("task thread panicked outside its handler");
            }
        }
    }
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, RunningMap> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decide(&self, doc: &Document, running: &RunningMap, id: TaskId, now: DateTime<Utc>) -> Step {
        let Some(task) = doc.task(id) else {
            return Step::Idle;
        };
        let status = task.status();
        if running.contains_key(&id) {
            return match (status, task.doing_since()) {
                (Status::Doing | Status::Undoing | Status::Abort, Some(since))
                    if self.is_stuck(id, since, now) =>
                {
                    Step::Stuck(since)
                }
                _ => Step::Idle,
            };
        }
        let scheduled = task.at_time().filter(|at| *at > now);

        match status {
            Status::Do | Status::Wait => {
                let mut all_done = true;
                for p in task.wait_tasks() {
                    match doc.task(*p).map(overlord_state::Task::status) {
                        Some(Status::Done) | None => {}
                        Some(
                            Status::Abort
                            | Status::Undo
                            | Status::Undoing
                            | Status::Undone
                            | Status::Error,
                        ) => {
                            return Step::Move(
                                Status::Undo,
                                format!("prerequisite task {p} will not complete"),
                            );
                        }
                        Some(_) => all_done = false,
                    }
                }
                if !all_done {
                    return if status == Status::Do {
                        Step::Move(Status::Wait, "waiting for prerequisites".to_owned())
                    } else {
                        Step::Idle
                    };
                }
                if status == Status::Wait {
                    return Step::Move(Status::Do, "prerequisites done".to_owned());
                }
                scheduled.map_or(Step::Dispatch(Direction::Do), Step::Wake)
            }
            Status::Undo => {
                if task.attempts() == 0 {
                    return Step::Move(Status::Undone, "never ran; nothing to undo".to_owned());
                }
                if !self.registry.is_revertible(task.kind()) {
                    return Step::Move(Status::Undone, "no undo handler".to_owned());
                }
                let blocked = task.halt_tasks().iter().any(|h| {
                    doc.task(*h).is_some_and(|t| {
                        matches!(
                            t.status(),
                            Status::Do
                                | Status::Wait
                                | Status::Doing
                                | Status::Abort
                                | Status::Undo
                                | Status::Undoing
                        )
                    })
                });
                if blocked {
                    return Step::Idle;
                }
                scheduled.map_or(Step::Dispatch(Direction::Undo), Step::Wake)
            }
            Status::Abort => Step::Move(Status::Undo, "aborted while not running".to_owned()),
            Status::Doing => scheduled.map_or(Step::Dispatch(Direction::Do), Step::Wake),
            Status::Undoing => scheduled.map_or(Step::Dispatch(Direction::Undo), Step::Wake),
            Status::Done | Status::Undone | Status::Error | Status::Hold => Step::Idle,
        }
    }

    fn is_stuck(&self, id: TaskId, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let over = (now - since)
            .to_std()
            .is_ok_and(|d| d >= self.config.stuck_after());
        over && !self
            .stuck_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    fn report_stuck(&self, doc: &mut Document, id: TaskId, since: DateTime<Utc>) {
        self.stuck_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        let secs = self.config.stuck_after_secs;
        warn!("task {id} has been running since {since} (over {secs}s)");
        if let Some(t) = doc.task_mut(id) {
            t.logf(
                LogLevel::Warning,
                format!("task has been running for more than {secs}s"),
            );
        }
    }

    fn transition(&self, doc: &mut Document, id: TaskId, status: Status, note: &str) {
        match doc.set_status(id, status) {
            Ok(()) => {
                if let Some(t) = doc.task_mut(id) {
                    t.logf(LogLevel::Info, note);
                }
            }
            Err(e) => warn!("task {id}: {e}"),
        }
    }

    fn execute(&self, id: TaskId, direction: Direction, cancel: CancelToken) {
        let state = self.state.clone();
        let guard = state.lock();
        let Some((kind, change)) = guard.task(id).map(|t| (t.kind().to_owned(), t.change()))
        else {
            drop(guard);
            self.running().remove(&id);
            return;
        };
        let handler = self.registry.handler(&kind, direction);

        let mut ctx = TaskContext::new(&state, guard, id, change, cancel);
        let result: HandlerResult = match handler {
            Some(h) => panic::catch_unwind(AssertUnwindSafe(|| (*h)(&mut ctx))).unwrap_or_else(
                |payload| {
                    Err(TaskError::Fatal(format!(
                        "handler panicked: {}",
                        panic_message(&*payload)
                    )))
                },
            ),
            None => Err(TaskError::Fatal(format!(
                "no {direction} handler for task kind {kind:?}"
            ))),
        };

        let mut guard = ctx.into_guard();
        {
            let mut running = self.running();
            self.apply_result(&mut guard, &running, id, direction, result, Utc::now());
            running.remove(&id);
        }
        if let Err(e) = guard.unlock() {
            error!("cannot checkpoint after task {id}: {e}");
        }
        self.state.ensure_before(Duration::ZERO);
    }

    fn apply_result(
        &self,
        doc: &mut Document,
        running: &RunningMap,
        id: TaskId,
        direction: Direction,
        result: HandlerResult,
        now: DateTime<Utc>,
    ) {
        let Some(status) = doc.task(id).map(overlord_state::Task::status) else {
            return;
        };
        self.stuck_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match direction {
            Direction::Do => self.finish_do(doc, running, id, status, result, now),
            Direction::Undo => self.finish_undo(doc, id, result, now),
            Direction::Cleanup => finish_cleanup(doc, id, result, now),
        }
    }

    fn finish_do(
        &self,
        doc: &mut Document,
        running: &RunningMap,
        id: TaskId,
        status: Status,
        result: HandlerResult,
        now: DateTime<Utc>,
    ) {
        if status == Status::Abort {
            match result {
                Err(TaskError::Fatal(reason)) => {
                    if let Some(t) = doc.task_mut(id) {
                        t.errorf(&reason);
                    }
                    self.transition(doc, id, Status::Error, "failed while aborting");
                }
                _ => self.transition(doc, id, Status::Undo, "aborted; undoing"),
            }
            return;
        }

        match result {
            Ok(Outcome::Complete) => {
                if let Some(t) = doc.task_mut(id) {
                    t.set_retries(0);
                }
                self.transition(doc, id, Status::Done, "done");
            }
            Ok(Outcome::Pending { repoll_after }) => {
                if let Some(t) = doc.task_mut(id) {
                    t.set_at_time(Some(later(now, repoll_after)));
                }
                debug!("task {id} still in progress, re-polling in {repoll_after:?}");
            }
            Err(TaskError::Cancelled) => {
                self.transition(doc, id, Status::Do, "cancelled; will run again");
            }
            Err(TaskError::Retry { reason, after }) => {
                let retries = doc.task(id).map_or(0, overlord_state::Task::retries) + 1;
                if self.retry.exhausted(retries) {
                    let reason = format!("{reason} (gave up after {} retries)", retries - 1);
                    self.fail(doc, running, id, &reason);
                    return;
                }
                let delay = after.unwrap_or_else(|| self.retry.delay(retries));
                self.transition(doc, id, Status::Do, "scheduled for retry");
                if let Some(t) = doc.task_mut(id) {
                    t.set_retries(retries);
                    t.set_at_time(Some(later(now, delay)));
                    t.logf(LogLevel::Warning, format!("{reason}; retrying in {delay:?}"));
                }
                info!("task {id} will retry in {delay:?}: {reason}");
            }
            Err(TaskError::Fatal(reason)) => self.fail(doc, running, id, &reason),
        }
    }

    fn finish_undo(&self, doc: &mut Document, id: TaskId, result: HandlerResult, now: DateTime<Utc>) {
        match result {
            Ok(Outcome::Complete) => {
                if let Some(t) = doc.task_mut(id) {
                    t.set_retries(0);
                }
                self.transition(doc, id, Status::Undone, "undone");
            }
            Ok(Outcome::Pending { repoll_after }) => {
                if let Some(t) = doc.task_mut(id) {
                    t.set_at_time(Some(later(now, repoll_after)));
                }
            }
            Err(TaskError::Cancelled) => {
                self.transition(doc, id, Status::Undo, "undo cancelled; will run again");
            }
            Err(TaskError::Retry { reason, after }) => {
                let retries = doc.task(id).map_or(0, overlord_state::Task::retries) + 1;
                if self.retry.exhausted(retries) {
                    let reason = format!("{reason} (gave up after {} retries)", retries - 1);
                    self.undo_failed(doc, id, &reason);
                    return;
                }
                let delay = after.unwrap_or_else(|| self.retry.delay(retries));
                self.transition(doc, id, Status::Undo, "undo scheduled for retry");
                if let Some(t) = doc.task_mut(id) {
                    t.set_retries(retries);
                    t.set_at_time(Some(later(now, delay)));
                    t.logf(LogLevel::Warning, format!("{reason}; retrying undo in {delay:?}"));
                }
            }
            Err(TaskError::Fatal(reason)) => self.undo_failed(doc, id, &reason),
        }
    }

    fn undo_failed(&self, doc: &mut Document, id: TaskId, reason: &str) {
        if let Some(t) = doc.task_mut(id) {
            t.errorf(reason);
        }
        error!("undo of task {id} failed: {reason}");
        self.transition(doc, id, Status::Error, "undo failed");
    }

    /// Mark `id` as failed and roll back its lanes.
    fn fail(&self, doc: &mut Document, running: &RunningMap, id: TaskId, reason: &str) {
        let kind = doc.task(id).map(|t| t.kind().to_owned()).unwrap_or_default();
        if let Some(t) = doc.task_mut(id) {
            t.errorf(reason);
        }
        error!("task {id} ({kind}) failed: {reason}");
        self.transition(doc, id, Status::Error, "failed");
        let plan = plan_lane_abort(doc, id, |k| self.registry.is_revertible(k));
        self.apply_plan(doc, &plan, running, &format!("task {id} failed"));
    }

    fn apply_plan(&self, doc: &mut Document, plan: &UndoPlan, running: &RunningMap, cause: &str) {
        if plan.is_empty() {
            return;
        }
        for id in &plan.undo {
            let was_done = doc.task(*id).is_some_and(|t| t.status() == Status::Done);
            if doc.set_status(*id, Status::Undo).is_ok() {
                if let Some(t) = doc.task_mut(*id) {
                    // Done tasks ran even when no attempt was counted, as in
                    // documents written before attempts were recorded.
                    if was_done && t.attempts() == 0 {
                        t.note_attempt();
                    }
                    t.set_retries(0);
                    t.set_at_time(None);
                    t.logf(LogLevel::Info, format!("undoing: {cause}"));
                }
            }
        }
        for id in &plan.abort {
            if doc.set_status(*id, Status::Abort).is_ok() {
                if let Some(t) = doc.task_mut(*id) {
                    t.logf(LogLevel::Info, format!("aborting: {cause}"));
                }
            }
            if let Some(r) = running.get(id) {
                r.cancel.cancel();
            }
        }
        for id in &plan.irreversible {
            if let Err(e) = doc.mark_irreversible(*id) {
                warn!("{e}");
                continue;
            }
            if let Some(t) = doc.task_mut(*id) {
                t.logf(LogLevel::Warning, format!("cannot be undone ({cause})"));
            }
            warn!("task {id} is done and cannot be undone ({cause})");
        }
        info!(
            "{cause}: undo order {:?}, aborting {:?}",
            plan.undo, plan.abort
        );
    }
}

fn finish_cleanup(doc: &mut Document, id: TaskId, result: HandlerResult, now: DateTime<Utc>) {
    let Some(t) = doc.task_mut(id) else {
        return;
    };
    match result {
        Ok(Outcome::Complete) => t.set_clean(),
        Ok(Outcome::Pending { repoll_after: delay })
        | Err(TaskError::Retry {
            after: Some(delay), ..
        }) => t.set_at_time(Some(later(now, delay))),
        Err(TaskError::Retry { after: None, .. }) => {
            t.set_at_time(Some(later(now, RetryPolicy::default().delay(1))));
        }
        Err(TaskError::Cancelled) => {}
        Err(TaskError::Fatal(reason)) => {
            warn!("cleanup of task {id} failed: {reason}");
            t.logf(LogLevel::Error, format!("cleanup failed: {reason}"));
            t.set_clean();
        }
    }
}

fn later(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(_: &mut TaskContext<'_>) -> HandlerResult {
        Ok(Outcome::Complete)
    }

    fn runner_with(registry: HandlerRegistry) -> TaskRunner {
        TaskRunner::new(State::in_memory(), registry, EngineConfig::default()).unwrap()
    }

    #[test]
    fn empty_pass_is_idle() {
        let runner = runner_with(HandlerRegistry::new());
        let report = runner.ensure().unwrap();
        assert!(report.is_idle());
        assert!(report.next_wakeup.is_none());
    }

    #[test]
    fn unknown_pending_kind_fails_startup() {
        let state = State::in_memory();
        {
            let mut st = state.lock();
            let chg = st.new_change("install-snap", "Install");
            st.new_task(chg, "mount-snap", "Mount").unwrap();
        }
        let err = TaskRunner::new(state, HandlerRegistry::new(), EngineConfig::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownKinds(_)));
    }

    #[test]
    fn blocked_task_is_stored_as_wait() {
        let mut reg = HandlerRegistry::new();
        reg.register("step", ok, ok).unwrap();
        let runner = runner_with(reg);
        let (t1, t2) = {
            let mut st = runner.state().lock();
            let chg = st.new_change("install-snap", "Install");
            let t1 = st.new_task(chg, "step", "first").unwrap();
            let t2 = st.new_task(chg, "step", "second").unwrap();
            st.wait_for(t2, t1).unwrap();
            st.hold(t1).unwrap();
            (t1, t2)
        };
        let report = runner.ensure().unwrap();
        assert_eq!(report.dispatched, 0);
        let st = runner.state().lock();
        assert_eq!(st.task(t1).unwrap().status(), Status::Hold);
        assert_eq!(st.task(t2).unwrap().status(), Status::Wait);
    }

    #[test]
    fn never_started_undo_skips_handler() {
        let mut reg = HandlerRegistry::new();
        reg.register("step", ok, |_: &mut TaskContext<'_>| -> HandlerResult {
            panic!("undo must not run for a task that never ran")
        })
        .unwrap();
        let runner = runner_with(reg);
        let t = {
            let mut st = runner.state().lock();
            let chg = st.new_change("install-snap", "Install");
            let t = st.new_task(chg, "step", "step").unwrap();
            st.set_status(t, Status::Undo).unwrap();
            t
        };
        runner.settle(Duration::from_secs(5)).unwrap();
        assert_eq!(runner.state().lock().task(t).unwrap().status(), Status::Undone);
    }

    #[test]
    fn ensure_after_stop_fails() {
        let runner = runner_with(HandlerRegistry::new());
        runner.stop();
        assert!(matches!(runner.ensure(), Err(EngineError::Stopped)));
    }

    #[test]
    fn later_saturates() {
        let now = Utc::now();
        assert_eq!(later(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(later(now, Duration::from_secs(1)) > now);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
    }
}
