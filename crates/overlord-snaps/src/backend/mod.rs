//! On-disk effects of snap tasks under a root directory.
//!
//! ```text
//! <root>/snaps/<name>_<rev>.snap   downloaded snap files
//! <root>/snap/<name>/<rev>/        mounted revisions
//! <root>/snap/<name>/current       symlink to the active revision
//! ```
//!
//! Every operation checks what is already on disk before acting, so a task
//! re-run after a crash finds its own partial work and finishes it.

mod link;

use crate::{validate_name, SnapError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What a snap task operates on. Stored in the task's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapSetup {
    pub name: String,
    pub revision: u32,
}

impl SnapSetup {
    pub fn new(name: &str, revision: u32) -> Self {
        Self {
            name: name.to_owned(),
            revision,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkBackend {
    root: PathBuf,
}

const MOUNTED_FILE: &str = "snap.bin";

impl LinkBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("snaps")
    }

    #[inline]
    pub fn blob_path(&self, name: &str, revision: u32) -> PathBuf {
        self.blobs_dir().join(format!("{name}_{revision}.snap"))
    }

    #[inline]
    pub fn snap_dir(&self, name: &str) -> PathBuf {
        self.root.join("snap").join(name)
    }

    #[inline]
    pub fn revision_dir(&self, name: &str, revision: u32) -> PathBuf {
        self.snap_dir(name).join(revision.to_string())
    }

    #[inline]
    pub fn current_link(&self, name: &str) -> PathBuf {
        self.snap_dir(name).join("current")
    }

    pub fn is_mounted(&self, name: &str, revision: u32) -> bool {
        self.revision_dir(name, revision).join(MOUNTED_FILE).is_file()
    }

    /// Unpack the downloaded snap file into its revision directory.
    pub fn mount(&self, setup: &SnapSetup) -> Result<(), SnapError> {
        validate_name(&setup.name)?;
        if setup.revision == 0 {
            return Err(SnapError::UnsetRevision(setup.name.clone()));
        }
        if self.is_mounted(&setup.name, setup.revision) {
            debug!("{} {} already mounted", setup.name, setup.revision);
            return Ok(());
        }
        let blob = self.blob_path(&setup.name, setup.revision);
        if !blob.is_file() {
            return Err(SnapError::MissingBlob(blob));
        }

        let target = self.revision_dir(&setup.name, setup.revision);
        let staging = self
            .snap_dir(&setup.name)
            .join(format!(".{}.partial", setup.revision));
        // Leftovers of an interrupted mount.
        remove_dir_if_exists(&staging)?;
        remove_dir_if_exists(&target)?;
        fs::create_dir_all(&staging)?;
        fs::copy(&blob, staging.join(MOUNTED_FILE))?;
        fs::rename(&staging, &target)?;
        fsync_dir(&self.snap_dir(&setup.name))?;
        debug!("mounted {} {}", setup.name, setup.revision);
        Ok(())
    }

    /// Remove a mounted revision unless it is the active one.
    ///
    /// Returns whether the revision directory is gone afterwards.
    pub fn unmount(&self, setup: &SnapSetup) -> Result<bool, SnapError> {
        if self.current(&setup.name)? == Some(setup.revision) {
            debug!(
                "{} {} is active, leaving it mounted",
                setup.name, setup.revision
            );
            return Ok(false);
        }
        remove_dir_if_exists(&self.revision_dir(&setup.name, setup.revision))?;
        Ok(true)
    }

    /// Delete a revision and, when nothing is left, the snap's directory.
    pub fn discard(&self, setup: &SnapSetup) -> Result<(), SnapError> {
        remove_dir_if_exists(&self.revision_dir(&setup.name, setup.revision))?;
        let blob = self.blob_path(&setup.name, setup.revision);
        match fs::remove_file(&blob) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let dir = self.snap_dir(&setup.name);
        if dir.is_dir() && fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir)?;
        }
        Ok(())
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), SnapError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    fs::File::open(dir)?.sync_all()
}
