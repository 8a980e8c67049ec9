use crate::change::{derive_status, Change};
use crate::data::DataBag;
use crate::ids::{ChangeId, LaneId, TaskId};
use crate::status::{validate_transition, Status};
use crate::task::{LogLevel, Task};
use crate::StateError;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// The whole persisted object graph.
///
/// Only reachable through a [`StateGuard`](crate::StateGuard); every structural
/// operation planners need (changes, tasks, edges, lanes) lives here so that
/// cross-task invariants are enforced in one place.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    data: DataBag,
    #[serde(default)]
    changes: BTreeMap<ChangeId, Change>,
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    last_change_id: u64,
    #[serde(default)]
    last_task_id: u64,
    #[serde(default)]
    last_lane_id: u64,
    #[serde(skip)]
    modified: bool,
}

impl Document {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        self.data.get(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.data.set(key, value)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.data.remove(key)
    }

    pub fn last_task_id(&self) -> u64 {
        self.last_task_id
    }

    pub fn last_change_id(&self) -> u64 {
        self.last_change_id
    }

    pub fn last_lane_id(&self) -> u64 {
        self.last_lane_id
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        self.last_change_id += 1;
        let id = ChangeId::new(self.last_change_id);
        self.changes.insert(id, Change::new(id, kind, summary));
        debug!("new change {id} ({kind})");
        id
    }

    /// Create a task in `Do` attached to `change`.
    ///
    /// Fails with [`StateError::StaleChange`] once the change has reached a
    /// terminal status.
    pub fn new_task(
        &mut self,
        change: ChangeId,
        kind: &str,
        summary: &str,
    ) -> Result<TaskId, StateError> {
        let chg = self
            .changes
            .get(&change)
            .ok_or(StateError::ChangeNotFound(change))?;
        if chg.ready_time().is_some() {
            return Err(StateError::StaleChange(format!(
                "change {change} is already {}",
                self.change_status(change).unwrap_or(Status::Done)
            )));
        }
        self.last_task_id += 1;
        let id = TaskId::new(self.last_task_id);
        self.tasks.insert(id, Task::new(id, change, kind, summary));
        if let Some(chg) = self.changes.get_mut(&change) {
            chg.push_task(id);
        }
        Ok(id)
    }

    pub fn new_lane(&mut self) -> LaneId {
        self.last_lane_id += 1;
        LaneId::new(self.last_lane_id)
    }

    /// Make `task` wait for `prerequisite` to be `Done` before it runs.
    pub fn wait_for(&mut self, task: TaskId, prerequisite: TaskId) -> Result<(), StateError> {
        if task == prerequisite {
            return Err(StateError::Cycle { task, prerequisite });
        }
        let waiter = self.task(task).ok_or(StateError::TaskNotFound(task))?;
        if self.task(prerequisite).is_none() {
            return Err(StateError::TaskNotFound(prerequisite));
        }
        if !matches!(waiter.status(), Status::Do | Status::Wait | Status::Hold) {
            return Err(StateError::StaleChange(format!(
                "task {task} is already {}",
                waiter.status()
            )));
        }
        if self.depends_on(prerequisite, task) {
            return Err(StateError::Cycle { task, prerequisite });
        }
        if let Some(t) = self.tasks.get_mut(&task) {
            t.push_wait(prerequisite);
        }
        if let Some(p) = self.tasks.get_mut(&prerequisite) {
            p.push_halt(task);
        }
        Ok(())
    }

    /// True when `task` transitively waits for `target`.
    pub fn depends_on(&self, task: TaskId, target: TaskId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![task];
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(t) = self.tasks.get(&current) {
                stack.extend_from_slice(t.wait_tasks());
            }
        }
        false
    }

    pub fn join_lane(&mut self, task: TaskId, lane: LaneId) -> Result<(), StateError> {
        if lane.get() > self.last_lane_id {
            return Err(StateError::UnknownLane(lane));
        }
        let t = self.tasks.get_mut(&task).ok_or(StateError::TaskNotFound(task))?;
        if !matches!(t.status(), Status::Do | Status::Wait | Status::Hold) {
            return Err(StateError::StaleChange(format!(
                "task {task} is already {}",
                t.status()
            )));
        }
        t.push_lane(lane);
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn change(&self, id: ChangeId) -> Option<&Change> {
        self.changes.get(&id)
    }

    pub fn change_mut(&mut self, id: ChangeId) -> Option<&mut Change> {
        self.changes.get_mut(&id)
    }

    pub fn changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    /// Tasks of a change, in creation order.
    pub fn change_tasks(&self, id: ChangeId) -> Vec<&Task> {
        self.changes
            .get(&id)
            .map(|c| c.task_ids().iter().filter_map(|t| self.tasks.get(t)).collect())
            .unwrap_or_default()
    }

    pub fn change_status(&self, id: ChangeId) -> Option<Status> {
        let chg = self.changes.get(&id)?;
        let statuses: Vec<Status> = chg
            .task_ids()
            .iter()
            .filter_map(|t| self.tasks.get(t))
            .map(Task::status)
            .collect();
        Some(derive_status(&statuses, chg.is_partially_irreversible()))
    }

    pub fn change_is_ready(&self, id: ChangeId) -> bool {
        self.change_status(id).is_some_and(Status::is_ready)
    }

    /// A change is clean when it is ready and every task has been cleaned up.
    pub fn change_is_clean(&self, id: ChangeId) -> bool {
        self.change_is_ready(id) && self.change_tasks(id).iter().all(|t| t.is_clean())
    }

    /// Changes that still have work to do.
    pub fn pending_changes(&self) -> Vec<ChangeId> {
        self.changes
            .keys()
            .copied()
            .filter(|id| !self.change_is_ready(*id))
            .collect()
    }

    /// Move a task to `status`, enforcing the lifecycle and keeping the
    /// owning change's ready time current.
    pub fn set_status(&mut self, task: TaskId, status: Status) -> Result<(), StateError> {
        let t = self.tasks.get_mut(&task).ok_or(StateError::TaskNotFound(task))?;
        let from = t.status();
        validate_transition(from, status)?;
        if from == status {
            return Ok(());
        }
        t.set_status_unchecked(status);
        let change = t.change();
        debug!("task {task} {from} -> {status}");
        self.sync_ready_time(change);
        Ok(())
    }

    /// Record that a `Done` task of `change` cannot be reverted.
    pub fn mark_irreversible(&mut self, task: TaskId) -> Result<(), StateError> {
        let change = self.task(task).ok_or(StateError::TaskNotFound(task))?.change();
        if let Some(chg) = self.changes.get_mut(&change) {
            chg.mark_irreversible(task);
        }
        self.sync_ready_time(change);
        Ok(())
    }

    fn sync_ready_time(&mut self, change: ChangeId) {
        let ready = self.change_is_ready(change);
        if let Some(chg) = self.changes.get_mut(&change) {
            match (ready, chg.ready_time()) {
                (true, None) => chg.set_ready_time(Some(Utc::now())),
                (false, Some(_)) => chg.set_ready_time(None),
                _ => {}
            }
        }
    }

    /// Pause a task that has not started yet.
    pub fn hold(&mut self, task: TaskId) -> Result<(), StateError> {
        let status = self.task(task).ok_or(StateError::TaskNotFound(task))?.status();
        if !matches!(status, Status::Do | Status::Wait) {
            return Err(StateError::InvalidTransition {
                from: status.to_string(),
                to: Status::Hold.to_string(),
            });
        }
        self.set_status(task, Status::Hold)?;
        if let Some(t) = self.tasks.get_mut(&task) {
            t.logf(LogLevel::Info, "task held");
        }
        Ok(())
    }

    pub fn release(&mut self, task: TaskId) -> Result<(), StateError> {
        let status = self.task(task).ok_or(StateError::TaskNotFound(task))?.status();
        if status != Status::Hold {
            return Err(StateError::InvalidTransition {
                from: status.to_string(),
                to: Status::Do.to_string(),
            });
        }
        self.set_status(task, Status::Do)?;
        if let Some(t) = self.tasks.get_mut(&task) {
            t.logf(LogLevel::Info, "task released");
        }
        Ok(())
    }

    /// Ask the engine to abort a change; the next ensure pass applies it.
    pub fn request_abort(&mut self, change: ChangeId) -> Result<(), StateError> {
        let ready = self.change_is_ready(change);
        let chg = self
            .changes
            .get_mut(&change)
            .ok_or(StateError::ChangeNotFound(change))?;
        if ready {
            return Err(StateError::StaleChange(format!(
                "change {change} is already ready"
            )));
        }
        chg.request_abort();
        Ok(())
    }

    /// Remove a change together with its tasks, dropping edges that pointed
    /// at them from tasks of other changes.
    pub fn remove_change(&mut self, id: ChangeId) -> Option<Change> {
        let chg = self.changes.remove(&id)?;
        for task in chg.task_ids() {
            self.remove_task(*task);
        }
        Some(chg)
    }

    pub(crate) fn remove_task(&mut self, id: TaskId) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        for other in task.wait_tasks().iter().chain(task.halt_tasks()) {
            if let Some(t) = self.tasks.get_mut(other) {
                t.forget_task(id);
            }
        }
        if let Some(chg) = self.changes.get_mut(&task.change()) {
            chg.forget_task(id);
        }
        Some(task)
    }

    pub(crate) fn orphan_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| {
                self.changes
                    .get(&t.change())
                    .map_or(true, |c| !c.task_ids().contains(&t.id()))
            })
            .map(Task::id)
            .collect()
    }

    /// Raise counters that fell behind stored ids. Returns true if any moved.
    pub(crate) fn repair_counters(&mut self) -> bool {
        let max_task = self.tasks.keys().next_back().map_or(0, |id| id.get());
        let max_change = self.changes.keys().next_back().map_or(0, |id| id.get());
        let max_lane = self
            .tasks
            .values()
            .flat_map(Task::lanes)
            .map(|l| l.get())
            .max()
            .unwrap_or(0);
        let mut repaired = false;
        if max_task > self.last_task_id {
            self.last_task_id = max_task;
            repaired = true;
        }
        if max_change > self.last_change_id {
            self.last_change_id = max_change;
            repaired = true;
        }
        if max_lane > self.last_lane_id {
            self.last_lane_id = max_lane;
            repaired = true;
        }
        repaired
    }

    /// Check referential integrity after a load.
    pub(crate) fn verify_references(&self) -> Result<(), String> {
        for (id, task) in &self.tasks {
            if task.id() != *id {
                return Err(format!("task stored under {id} claims id {}", task.id()));
            }
            for other in task.wait_tasks().iter().chain(task.halt_tasks()) {
                if !self.tasks.contains_key(other) {
                    return Err(format!("task {id} references missing task {other}"));
                }
            }
        }
        for (id, chg) in &self.changes {
            if chg.id() != *id {
                return Err(format!("change stored under {id} claims id {}", chg.id()));
            }
            for task in chg.task_ids() {
                match self.tasks.get(task) {
                    Some(t) if t.change() == *id => {}
                    Some(t) => {
                        return Err(format!(
                            "change {id} lists task {task} owned by change {}",
                            t.change()
                        ))
                    }
                    None => return Err(format!("change {id} lists missing task {task}")),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }
}
