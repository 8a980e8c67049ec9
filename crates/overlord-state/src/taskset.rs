use crate::document::Document;
use crate::ids::{LaneId, TaskId};
use crate::StateError;
use std::collections::BTreeMap;

/// An ordered group of tasks a planner hands back for one unit of work.
///
/// A task set only holds ids; edge operations go through the [`Document`] so
/// the cycle and staleness checks apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: Vec<TaskId>,
    edges: BTreeMap<String, TaskId>,
}

impl TaskSet {
    pub fn new(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        let mut ts = Self::default();
        for t in tasks {
            ts.add_task(t);
        }
        ts
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.tasks.contains(&task)
    }

    pub fn add_task(&mut self, task: TaskId) {
        if !self.tasks.contains(&task) {
            self.tasks.push(task);
        }
    }

    pub fn add_all(&mut self, other: &TaskSet) {
        for t in &other.tasks {
            self.add_task(*t);
        }
    }

    /// Make every task in the set wait for `prerequisite`.
    pub fn wait_for(&self, doc: &mut Document, prerequisite: TaskId) -> Result<(), StateError> {
        for t in &self.tasks {
            doc.wait_for(*t, prerequisite)?;
        }
        Ok(())
    }

    /// Make every task in the set wait for every task in `other`.
    pub fn wait_all(&self, doc: &mut Document, other: &TaskSet) -> Result<(), StateError> {
        for prerequisite in &other.tasks {
            self.wait_for(doc, *prerequisite)?;
        }
        Ok(())
    }

    pub fn join_lane(&self, doc: &mut Document, lane: LaneId) -> Result<(), StateError> {
        for t in &self.tasks {
            doc.join_lane(*t, lane)?;
        }
        Ok(())
    }

    /// Name a task of the set so later planners can hook onto it.
    pub fn mark_edge(&mut self, task: TaskId, edge: &str) {
        self.edges.insert(edge.to_owned(), task);
    }

    pub fn edge(&self, edge: &str) -> Result<TaskId, StateError> {
        self.maybe_edge(edge)
            .ok_or_else(|| StateError::NoState(format!("task set edge {edge:?}")))
    }

    pub fn maybe_edge(&self, edge: &str) -> Option<TaskId> {
        self.edges.get(edge).copied()
    }

    /// Tasks nothing else in the set waits for.
    pub fn tails(&self, doc: &Document) -> Vec<TaskId> {
        self.tasks
            .iter()
            .copied()
            .filter(|t| {
                doc.task(*t).map_or(true, |task| {
                    !task.halt_tasks().iter().any(|h| self.tasks.contains(h))
                })
            })
            .collect()
    }

    /// Tasks that wait for nothing else in the set.
    pub fn heads(&self, doc: &Document) -> Vec<TaskId> {
        self.tasks
            .iter()
            .copied()
            .filter(|t| {
                doc.task(*t).map_or(true, |task| {
                    !task.wait_tasks().iter().any(|w| self.tasks.contains(w))
                })
            })
            .collect()
    }
}

impl IntoIterator for TaskSet {
    type Item = TaskId;
    type IntoIter = std::vec::IntoIter<TaskId>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

impl<'a> IntoIterator for &'a TaskSet {
    type Item = &'a TaskId;
    type IntoIter = std::slice::Iter<'a, TaskId>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}
