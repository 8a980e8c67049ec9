use super::{fsync_dir, LinkBackend, SnapSetup};
use crate::SnapError;
use std::fs;
use std::os::unix::fs::symlink;
use tracing::{debug, info};

impl LinkBackend {
    /// Revision the `current` link points at, if any.
    pub fn current(&self, name: &str) -> Result<Option<u32>, SnapError> {
        let link = self.current_link(name);
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        target
            .to_str()
            .and_then(|s| s.parse().ok())
            .map(Some)
            .ok_or_else(|| SnapError::BadLink {
                name: name.to_owned(),
                target: target.display().to_string(),
            })
    }

    /// Make `setup`'s revision the active one.
    ///
    /// Linking an already active revision does nothing.
    pub fn link(&self, setup: &SnapSetup) -> Result<(), SnapError> {
        if setup.revision == 0 {
            return Err(SnapError::UnsetRevision(setup.name.clone()));
        }
        if !self.is_mounted(&setup.name, setup.revision) {
            return Err(SnapError::MissingRevision {
                name: setup.name.clone(),
                revision: setup.revision,
                path: self.revision_dir(&setup.name, setup.revision),
            });
        }
        if self.current(&setup.name)? == Some(setup.revision) {
            debug!("{} {} already linked", setup.name, setup.revision);
            return Ok(());
        }
        self.point_current(&setup.name, setup.revision)?;
        info!("linked {} revision {}", setup.name, setup.revision);
        Ok(())
    }

    /// Put the `current` link back to `previous`, or remove it when the snap
    /// had no active revision before.
    ///
    /// Repeating an unlink leaves the same result.
    pub fn unlink(&self, name: &str, previous: Option<u32>) -> Result<(), SnapError> {
        let current = self.current(name)?;
        match previous {
            Some(rev) if current == Some(rev) => {
                debug!("{name} already back at revision {rev}");
                Ok(())
            }
            Some(rev) => {
                if !self.is_mounted(name, rev) {
                    return Err(SnapError::MissingRevision {
                        name: name.to_owned(),
                        revision: rev,
                        path: self.revision_dir(name, rev),
                    });
                }
                self.point_current(name, rev)?;
                info!("restored {name} to revision {rev}");
                Ok(())
            }
            None if current.is_none() => Ok(()),
            None => {
                fs::remove_file(self.current_link(name))?;
                fsync_dir(&self.snap_dir(name))?;
                info!("unlinked {name}");
                Ok(())
            }
        }
    }

    /// Swap the link atomically: a fresh symlink renamed over the old one.
    fn point_current(&self, name: &str, revision: u32) -> Result<(), SnapError> {
        let dir = self.snap_dir(name);
        let staging = dir.join(".current.partial");
        match fs::remove_file(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        symlink(revision.to_string(), &staging)?;
        fs::rename(&staging, self.current_link(name))?;
        fsync_dir(&dir)?;
        Ok(())
    }
}
