use crate::backend::{LinkBackend, SnapSetup};
use crate::plan::{DISCARD_SNAP, LINK_SNAP, MOUNT_SNAP, PREPARE_SNAP, SNAP_SETUP_KEY, UNLINK_SNAP};
use crate::validate_name;
use overlord_engine::{EngineError, HandlerRegistry, HandlerResult, Outcome, TaskContext, TaskError};
use overlord_state::{LogLevel, Status};
use std::sync::Arc;
use tracing::debug;

/// Task data key: the revision that was active before the task changed the
/// `current` link. `null` when there was none.
pub const PREVIOUS_REVISION_KEY: &str = "previous-revision";

/// Register do, undo and cleanup handlers for every snap task kind.
pub fn register_handlers(
    registry: &mut HandlerRegistry,
    backend: &Arc<LinkBackend>,
) -> Result<(), EngineError> {
    registry.register(PREPARE_SNAP, do_prepare, |_| Ok(Outcome::Complete))?;

    let be = Arc::clone(backend);
    let undo_be = Arc::clone(backend);
    registry.register(
        MOUNT_SNAP,
        move |ctx| do_mount(ctx, &be),
        move |ctx| undo_mount(ctx, &undo_be),
    )?;

    let be = Arc::clone(backend);
    let undo_be = Arc::clone(backend);
    registry.register(
        LINK_SNAP,
        move |ctx| do_link(ctx, &be),
        move |ctx| undo_link(ctx, &undo_be),
    )?;
    let be = Arc::clone(backend);
    registry.register_cleanup(LINK_SNAP, move |ctx| cleanup_link(ctx, &be))?;

    let be = Arc::clone(backend);
    let undo_be = Arc::clone(backend);
    registry.register(
        UNLINK_SNAP,
        move |ctx| do_unlink(ctx, &be),
        move |ctx| undo_unlink(ctx, &undo_be),
    )?;

    let be = Arc::clone(backend);
    registry.register_irreversible(DISCARD_SNAP, move |ctx| do_discard(ctx, &be))?;
    Ok(())
}

fn setup(ctx: &TaskContext<'_>) -> Result<SnapSetup, TaskError> {
    Ok(ctx.get(SNAP_SETUP_KEY)?)
}

/// The revision recorded before the first attempt touched the link, or the
/// one active now when nothing was recorded yet.
fn previous_revision(
    ctx: &mut TaskContext<'_>,
    backend: &LinkBackend,
    name: &str,
) -> Result<Option<u32>, TaskError> {
    match ctx.get::<Option<u32>>(PREVIOUS_REVISION_KEY) {
        Ok(previous) => Ok(previous),
        Err(e) if e.is_no_state() => {
            let current = backend.current(name)?;
            ctx.set(PREVIOUS_REVISION_KEY, &current)?;
            Ok(current)
        }
        Err(e) => Err(e.into()),
    }
}

fn do_prepare(ctx: &mut TaskContext<'_>) -> HandlerResult {
    let setup = setup(ctx)?;
    validate_name(&setup.name)?;
    if setup.revision == 0 {
        return Err(TaskError::fatal(format!(
            "cannot install snap {:?} with unset revision",
            setup.name
        )));
    }
    ctx.logf(
        LogLevel::Info,
        format!("installing {} revision {}", setup.name, setup.revision),
    );
    Ok(Outcome::Complete)
}

fn do_mount(ctx: &mut TaskContext<'_>, backend: &LinkBackend) -> HandlerResult {
    let setup = setup(ctx)?;
    ctx.without_lock(|_| backend.mount(&setup))?;
    Ok(Outcome::Complete)
}

fn undo_mount(ctx: &mut TaskContext<'_>, backend: &LinkBackend) -> HandlerResult {
    let setup = setup(ctx)?;
    let removed = ctx.without_lock(|_| backend.unmount(&setup))?;
    if !removed {
        ctx.logf(
            LogLevel::Warning,
            format!("revision {} is active, not removing it", setup.revision),
        );
    }
    Ok(Outcome::Complete)
}

fn do_link(ctx: &mut TaskContext<'_>, backend: &LinkBackend) -> HandlerResult {
    let setup = setup(ctx)?;
    let previous = previous_revision(ctx, backend, &setup.name)?;
    // Checkpoints the recorded revision before the link changes.
    ctx.without_lock(|_| backend.link(&setup))?;
    if let Some(rev) = previous {
        ctx.logf(
            LogLevel::Info,
            format!("replaced revision {rev} of {}", setup.name),
        );
    }
    Ok(Outcome::Complete)
}

fn undo_link(ctx: &mut TaskContext<'_>, backend: &LinkBackend) -> HandlerResult {
    let setup = setup(ctx)?;
    let previous = match ctx.get::<Option<u32>>(PREVIOUS_REVISION_KEY) {
        Ok(previous) => previous,
        Err(e) if e.is_no_state() => {
            debug!("link of {} never started, nothing to undo", setup.name);
            return Ok(Outcome::Complete);
        }
        Err(e) => return Err(e.into()),
    };
    ctx.without_lock(|_| {
        let current = backend.current(&setup.name)?;
        if current != Some(setup.revision) && current != previous {
            // Someone else moved the link since; leave it alone.
            return Ok(());
        }
        backend.unlink(&setup.name, previous)
    })?;
    Ok(Outcome::Complete)
}

fn cleanup_link(ctx: &mut TaskContext<'_>, backend: &LinkBackend) -> HandlerResult {
    if ctx.task()?.status() != Status::Done {
        return Ok(Outcome::Complete);
    }
    let setup = setup(ctx)?;
    let blob = backend.blob_path(&setup.name, setup.revision);
    ctx.without_lock(|_| match std::fs::remove_file(&blob) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(crate::SnapError::Io(e)),
    })?;
    Ok(Outcome::Complete)
}

fn do_unlink(ctx: &mut TaskContext<'_>, backend: &LinkBackend) -> HandlerResult {
    let setup = setup(ctx)?;
    previous_revision(ctx, backend, &setup.name)?;
    ctx.without_lock(|_| backend.unlink(&setup.name, None))?;
    Ok(Outcome::Complete)
}

fn undo_unlink(ctx: &mut TaskContext<'_>, backend: &LinkBackend) -> HandlerResult {
    let setup = setup(ctx)?;
    let previous = match ctx.get::<Option<u32>>(PREVIOUS_REVISION_KEY) {
        Ok(previous) => previous,
        Err(e) if e.is_no_state() => return Ok(Outcome::Complete),
        Err(e) => return Err(e.into()),
    };
    ctx.without_lock(|_| backend.unlink(&setup.name, previous))?;
    Ok(Outcome::Complete)
}

fn do_discard(ctx: &mut TaskContext<'_>, backend: &LinkBackend) -> HandlerResult {
    let setup = setup(ctx)?;
    ctx.without_lock(|_| backend.discard(&setup))?;
    ctx.logf(
        LogLevel::Info,
        format!("removed {} revision {}", setup.name, setup.revision),
    );
    Ok(Outcome::Complete)
}
