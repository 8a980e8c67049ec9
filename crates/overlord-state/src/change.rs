use crate::data::DataBag;
use crate::ids::{ChangeId, TaskId};
use crate::status::Status;
use crate::StateError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A user-visible operation made of tasks.
///
/// The status is never stored: [`Document::change_status`](crate::Document::change_status)
/// derives it from the tasks every time it is asked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    id: ChangeId,
    kind: String,
    summary: String,
    #[serde(default)]
    task_ids: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    data: DataBag,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
    /// Done tasks that could not be undone during a cascade.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    irreversible: Vec<TaskId>,
    #[serde(default)]
    abort_requested: bool,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_owned(),
            summary: summary.to_owned(),
            task_ids: Vec::new(),
            data: DataBag::default(),
            spawn_time: Utc::now(),
            ready_time: None,
            irreversible: Vec::new(),
            abort_requested: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ChangeId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[inline]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        self.data.get(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        self.data.set(key, value)
    }

    pub fn data(&self) -> &DataBag {
        &self.data
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Done tasks left in place because their kind cannot be undone.
    pub fn irreversible(&self) -> &[TaskId] {
        &self.irreversible
    }

    pub fn is_partially_irreversible(&self) -> bool {
        !self.irreversible.is_empty()
    }

    pub fn mark_irreversible(&mut self, task: TaskId) {
        if !self.irreversible.contains(&task) {
            self.irreversible.push(task);
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested
    }

    pub fn clear_abort_request(&mut self) {
        self.abort_requested = false;
    }

    pub(crate) fn request_abort(&mut self) {
        self.abort_requested = true;
    }

    pub(crate) fn push_task(&mut self, id: TaskId) {
        self.task_ids.push(id);
    }

    pub(crate) fn forget_task(&mut self, id: TaskId) {
        self.task_ids.retain(|t| *t != id);
        self.irreversible.retain(|t| *t != id);
    }

    pub(crate) fn set_ready_time(&mut self, at: Option<DateTime<Utc>>) {
        self.ready_time = at;
    }
}

/// Priority order used to fold task statuses into a change status while work
/// remains.
const PENDING_ORDER: [Status; 7] = [
    Status::Abort,
    Status::Undoing,
    Status::Undo,
    Status::Doing,
    Status::Do,
    Status::Hold,
    Status::Wait,
];

/// Derive a change status from the statuses of its tasks.
///
/// - no tasks: `Done`
/// - any task still pending: the highest-priority pending status
/// - otherwise any `Error`, or any irreversible task left behind: `Error`
/// - all `Done`: `Done`
/// - otherwise: `Undone`
pub fn derive_status(statuses: &[Status], partially_irreversible: bool) -> Status {
    if statuses.is_empty() {
        return Status::Done;
    }
    for pending in PENDING_ORDER {
        if statuses.contains(&pending) {
            return pending;
        }
    }
    if statuses.contains(&Status::Error) || partially_irreversible {
        return Status::Error;
    }
    if statuses.iter().all(|s| *s == Status::Done) {
        Status::Done
    } else {
        Status::Undone
    }
}
