//! Undo cascade planning.
//!
//! These functions only read the document. The runner applies the returned
//! plan; keeping the graph walk pure lets the lane rules be tested on their
//! own.

use overlord_state::{ChangeId, Document, Status, Task, TaskId};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UndoPlan {
    /// Tasks to move to `Undo`, dependents before their prerequisites.
    pub undo: Vec<TaskId>,
    /// Running tasks to move to `Abort` and cancel.
    pub abort: Vec<TaskId>,
    /// `Done` tasks whose kind has no undo handler.
    pub irreversible: Vec<TaskId>,
}

impl UndoPlan {
    pub fn is_empty(&self) -> bool {
        self.undo.is_empty() && self.abort.is_empty() && self.irreversible.is_empty()
    }
}

/// Plan the rollback caused by `failing` erroring: every other task of the
/// same change that shares one of its lanes.
pub fn plan_lane_abort(
    doc: &Document,
    failing: TaskId,
    is_revertible: impl Fn(&str) -> bool,
) -> UndoPlan {
    let Some(task) = doc.task(failing) else {
        return UndoPlan::default();
    };
    let lanes = task.effective_lanes();
    let scope = doc
        .change_tasks(task.change())
        .into_iter()
        .filter(|t| t.id() != failing && t.shares_lane_with(&lanes));
    plan(doc, scope, is_revertible)
}

/// Plan the rollback of a whole change.
pub fn plan_change_abort(
    doc: &Document,
    change: ChangeId,
    is_revertible: impl Fn(&str) -> bool,
) -> UndoPlan {
    plan(doc, doc.change_tasks(change).into_iter(), is_revertible)
}

fn plan<'d>(
    doc: &Document,
    scope: impl Iterator<Item = &'d Task>,
    is_revertible: impl Fn(&str) -> bool,
) -> UndoPlan {
    let mut out = UndoPlan::default();
    let mut undo = Vec::new();
    for t in scope {
        match t.status() {
            Status::Do | Status::Wait | Status::Hold => undo.push(t.id()),
            Status::Doing => out.abort.push(t.id()),
            Status::Done if is_revertible(t.kind()) => undo.push(t.id()),
            Status::Done => out.irreversible.push(t.id()),
            _ => {}
        }
    }
    out.undo = undo_order(doc, &undo);
    out
}

/// Order `tasks` so every task comes before the tasks it waits for.
///
/// Only edges inside the set count. Ties go to the most recently created
/// task, so a plain chain unwinds last-in first-out.
pub fn undo_order(doc: &Document, tasks: &[TaskId]) -> Vec<TaskId> {
    let members: HashSet<TaskId> = tasks.iter().copied().collect();
    let mut dependents: HashMap<TaskId, usize> = HashMap::new();
    for id in &members {
        let count = doc.task(*id).map_or(0, |t| {
            t.halt_tasks().iter().filter(|h| members.contains(h)).count()
        });
        dependents.insert(*id, count);
    }

    let mut ready: BTreeSet<TaskId> = dependents
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(members.len());
    while let Some(id) = ready.pop_last() {
        order.push(id);
        let Some(task) = doc.task(id) else { continue };
        for prerequisite in task.wait_tasks() {
            if let Some(n) = dependents.get_mut(prerequisite) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(*prerequisite);
                }
            }
        }
    }
    order
}
