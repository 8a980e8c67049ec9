//! Install and remove planning.
//!
//! Planners only build task graphs; nothing touches the disk until the
//! runner dispatches the tasks. Each snap gets one task set, joined to the
//! lane its transaction asks for.

use crate::backend::{LinkBackend, SnapSetup};
use crate::transaction::Flags;
use crate::{validate_name, SnapError};
use overlord_state::{ChangeId, Document, LaneId, StateError, TaskId, TaskSet};
use tracing::info;

pub const PREPARE_SNAP: &str = "prepare-snap";
pub const MOUNT_SNAP: &str = "mount-snap";
pub const LINK_SNAP: &str = "link-snap";
pub const UNLINK_SNAP: &str = "unlink-snap";
pub const DISCARD_SNAP: &str = "discard-snap";

/// Task data key holding the task's [`SnapSetup`].
pub const SNAP_SETUP_KEY: &str = "snap-setup";

/// First task of a snap's set.
pub const BEGIN_EDGE: &str = "begin";
/// Task after which the snap is active (install) or gone (remove).
pub const LAST_EDGE: &str = "last";

fn add_task(
    doc: &mut Document,
    change: ChangeId,
    kind: &str,
    summary: String,
    setup: &SnapSetup,
    after: Option<TaskId>,
) -> Result<TaskId, SnapError> {
    let id = doc.new_task(change, kind, &summary)?;
    doc.task_mut(id)
        .ok_or(StateError::TaskNotFound(id))?
        .set(SNAP_SETUP_KEY, setup)?;
    if let Some(prev) = after {
        doc.wait_for(id, prev)?;
    }
    Ok(id)
}

fn install_tasks(
    doc: &mut Document,
    change: ChangeId,
    setup: &SnapSetup,
    lane: LaneId,
) -> Result<TaskSet, SnapError> {
    validate_name(&setup.name)?;
    if setup.revision == 0 {
        return Err(SnapError::UnsetRevision(setup.name.clone()));
    }
    let label = format!("snap {:?} ({})", setup.name, setup.revision);
    let prepare = add_task(doc, change, PREPARE_SNAP, format!("Prepare {label}"), setup, None)?;
    let mount = add_task(
        doc,
        change,
        MOUNT_SNAP,
        format!("Mount {label}"),
        setup,
        Some(prepare),
    )?;
    let link = add_task(
        doc,
        change,
        LINK_SNAP,
        format!("Make {label} available to the system"),
        setup,
        Some(mount),
    )?;

    let mut ts = TaskSet::new([prepare, mount, link]);
    ts.mark_edge(prepare, BEGIN_EDGE);
    ts.mark_edge(link, LAST_EDGE);
    ts.join_lane(doc, lane)?;
    Ok(ts)
}

/// Plan the installation of one snap.
pub fn install(
    doc: &mut Document,
    change: ChangeId,
    setup: &SnapSetup,
    flags: &Flags,
) -> Result<TaskSet, SnapError> {
    let mut flags = *flags;
    flags.set_default_lane(doc)?;
    let lane = flags.generate_lane(doc);
    install_tasks(doc, change, setup, lane)
}

/// Plan the installation of several snaps in one change.
///
/// Snaps whose requested revision is already active are skipped. The
/// returned sets are in request order, paired with their setup.
pub fn install_many(
    doc: &mut Document,
    backend: &LinkBackend,
    change: ChangeId,
    setups: &[SnapSetup],
    flags: &Flags,
) -> Result<Vec<(SnapSetup, TaskSet)>, SnapError> {
    let mut flags = *flags;
    flags.set_default_lane(doc)?;
    let mut planned = Vec::with_capacity(setups.len());
    for setup in setups {
        if backend.current(&setup.name)? == Some(setup.revision) {
            info!(
                "snap {} revision {} is already installed",
                setup.name, setup.revision
            );
            continue;
        }
        let lane = flags.generate_lane(doc);
        let ts = install_tasks(doc, change, setup, lane)?;
        planned.push((setup.clone(), ts));
    }
    Ok(planned)
}

/// Plan the removal of the active revision of `name`.
///
/// Unlinking can be undone; discarding the revision cannot.
pub fn remove(
    doc: &mut Document,
    backend: &LinkBackend,
    change: ChangeId,
    name: &str,
    flags: &Flags,
) -> Result<TaskSet, SnapError> {
    validate_name(name)?;
    let revision = backend
        .current(name)?
        .ok_or_else(|| SnapError::NotInstalled(name.to_owned()))?;
    let mut flags = *flags;
    flags.set_default_lane(doc)?;
    let lane = flags.generate_lane(doc);

    let setup = SnapSetup::new(name, revision);
    let label = format!("snap {name:?} ({revision})");
    let unlink = add_task(
        doc,
        change,
        UNLINK_SNAP,
        format!("Make {label} unavailable to the system"),
        &setup,
        None,
    )?;
    let discard = add_task(
        doc,
        change,
        DISCARD_SNAP,
        format!("Remove {label} from the system"),
        &setup,
        Some(unlink),
    )?;
    let mut ts = TaskSet::new([unlink, discard]);
    ts.mark_edge(unlink, BEGIN_EDGE);
    ts.mark_edge(discard, LAST_EDGE);
    ts.join_lane(doc, lane)?;
    Ok(ts)
}
