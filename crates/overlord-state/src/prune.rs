use crate::document::Document;
use crate::ids::{ChangeId, TaskId};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneOptions {
    /// Ready, clean changes older than this are removed.
    pub prune_wait: Duration,
    /// Unready changes older than this are aborted. `None` disables it.
    pub abort_wait: Option<Duration>,
    /// Upper bound on retained ready changes; the oldest go first.
    pub max_ready_changes: usize,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            prune_wait: Duration::from_secs(24 * 60 * 60),
            abort_wait: None,
            max_ready_changes: 500,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_changes: Vec<ChangeId>,
    pub aborted_changes: Vec<ChangeId>,
    pub removed_orphans: Vec<TaskId>,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.removed_changes.is_empty()
            && self.aborted_changes.is_empty()
            && self.removed_orphans.is_empty()
    }
}

fn before(now: DateTime<Utc>, wait: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
}

impl Document {
    /// Drop old ready changes, abort overdue unready ones, and remove tasks no
    /// change refers to.
    pub fn prune(&mut self, now: DateTime<Utc>, opts: &PruneOptions) -> PruneReport {
        let mut report = PruneReport::default();
        let prune_limit = before(now, opts.prune_wait);
        let abort_limit = opts.abort_wait.and_then(|w| before(now, w));

        let mut ready: Vec<(DateTime<Utc>, ChangeId)> = Vec::new();
        let mut overdue = Vec::new();
        for chg in self.changes() {
            let id = chg.id();
            if self.change_is_ready(id) {
                let at = chg.ready_time().unwrap_or_else(|| chg.spawn_time());
                if self.change_is_clean(id) && prune_limit.is_some_and(|limit| at < limit) {
                    report.removed_changes.push(id);
                } else {
                    ready.push((at, id));
                }
            } else if !chg.abort_requested()
                && abort_limit.is_some_and(|limit| chg.spawn_time() < limit)
            {
                overdue.push(id);
            }
        }

        if ready.len() > opts.max_ready_changes {
            ready.sort();
            let mut excess = ready.len() - opts.max_ready_changes;
            for (_, id) in ready {
                if excess == 0 {
                    break;
                }
                if self.change_is_clean(id) {
                    report.removed_changes.push(id);
                    excess -= 1;
                }
            }
        }

        for id in &report.removed_changes {
            self.remove_change(*id);
        }
        for id in overdue {
            if self.request_abort(id).is_ok() {
                warn!("change {id} was not ready after the abort deadline; aborting");
                report.aborted_changes.push(id);
            }
        }
        for id in self.orphan_tasks() {
            self.remove_task(id);
            report.removed_orphans.push(id);
        }

        if !report.is_empty() {
            info!(
                "pruned state: {} changes removed, {} aborted, {} orphan tasks",
                report.removed_changes.len(),
                report.aborted_changes.len(),
                report.removed_orphans.len()
            );
        }
        report
    }
}
