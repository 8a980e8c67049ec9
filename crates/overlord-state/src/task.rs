use crate::data::DataBag;
use crate::ids::{ChangeId, LaneId, TaskId};
use crate::status::Status;
use crate::StateError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Number of log lines retained per task; older lines are dropped first.
pub const MAX_LOG_ENTRIES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Progress counters reported to UIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub label: String,
    pub done: u64,
    pub total: u64,
}

/// A single resumable step of a [`Change`](crate::Change).
///
/// Structural edits that must stay consistent across tasks (dependency edges,
/// status changes) go through [`Document`](crate::Document); everything local
/// to the task is available here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    kind: String,
    summary: String,
    status: Status,
    change: ChangeId,
    #[serde(default)]
    clean: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "DataBag::is_empty")]
    data: DataBag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    wait_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    halt_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    lanes: Vec<LaneId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    log: Vec<String>,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    at_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    doing_since: Option<DateTime<Utc>>,
    /// Number of times the do handler was dispatched.
    #[serde(default)]
    attempts: u32,
    /// Consecutive retriable failures in the current direction.
    #[serde(default)]
    retries: u32,
}

impl Task {
    pub(crate) fn new(id: TaskId, change: ChangeId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_owned(),
            summary: summary.to_owned(),
            status: Status::Do,
            change,
            clean: false,
            progress: None,
            data: DataBag::default(),
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            lanes: Vec::new(),
            log: Vec::new(),
            spawn_time: Utc::now(),
            ready_time: None,
            at_time: None,
            doing_since: None,
            attempts: 0,
            retries: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
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

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    #[inline]
    pub fn change(&self) -> ChangeId {
        self.change
    }

    pub fn wait_tasks(&self) -> &[TaskId] {
        &self.wait_tasks
    }

    pub fn halt_tasks(&self) -> &[TaskId] {
        &self.halt_tasks
    }

    pub fn lanes(&self) -> &[LaneId] {
        &self.lanes
    }

    /// Lanes used for cascade scoping: a task that never joined a lane is in
    /// [`LaneId::NONE`].
    pub fn effective_lanes(&self) -> Vec<LaneId> {
        if self.lanes.is_empty() {
            vec![LaneId::NONE]
        } else {
            self.lanes.clone()
        }
    }

    pub fn shares_lane_with(&self, lanes: &[LaneId]) -> bool {
        self.effective_lanes().iter().any(|l| lanes.contains(l))
    }

    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn set_clean(&mut self) {
        self.clean = true;
    }

    pub fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    pub fn set_progress(&mut self, label: &str, done: u64, total: u64) {
        self.progress = Some(Progress {
            label: label.to_owned(),
            done: done.min(total),
            total,
        });
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// Append a timestamped line to the task log.
    pub fn logf(&mut self, level: LogLevel, msg: impl std::fmt::Display) {
        let line = format!(
            "{} {level} {msg}",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        );
        self.log.push(line);
        if self.log.len() > MAX_LOG_ENTRIES {
            let excess = self.log.len() - MAX_LOG_ENTRIES;
            self.log.drain(..excess);
        }
    }

    pub fn errorf(&mut self, msg: impl std::fmt::Display) {
        self.logf(LogLevel::Error, msg);
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

    pub fn data_mut(&mut self) -> &mut DataBag {
        &mut self.data
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Earliest time at which the runner may dispatch this task again.
    pub fn at_time(&self) -> Option<DateTime<Utc>> {
        self.at_time
    }

    pub fn set_at_time(&mut self, at: Option<DateTime<Utc>>) {
        self.at_time = at;
    }

    pub fn doing_since(&self) -> Option<DateTime<Utc>> {
        self.doing_since
    }

    pub fn set_doing_since(&mut self, since: Option<DateTime<Utc>>) {
        self.doing_since = since;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn note_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    pub(crate) fn set_status_unchecked(&mut self, status: Status) {
        self.status = status;
        if status.is_ready() {
            self.ready_time = Some(Utc::now());
            self.at_time = None;
            self.doing_since = None;
        } else {
            self.ready_time = None;
        }
    }

    pub(crate) fn push_wait(&mut self, id: TaskId) {
        if !self.wait_tasks.contains(&id) {
            self.wait_tasks.push(id);
        }
    }

    pub(crate) fn push_halt(&mut self, id: TaskId) {
        if !self.halt_tasks.contains(&id) {
            self.halt_tasks.push(id);
        }
    }

    pub(crate) fn push_lane(&mut self, lane: LaneId) {
        if !lane.is_none() && !self.lanes.contains(&lane) {
            self.lanes.push(lane);
        }
    }

    pub(crate) fn forget_task(&mut self, id: TaskId) {
        self.wait_tasks.retain(|t| *t != id);
        self.halt_tasks.retain(|t| *t != id);
    }
}
