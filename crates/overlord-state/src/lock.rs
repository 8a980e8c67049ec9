use crate::StateError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock marking one process as the owner of a state file.
///
/// The lock is released on drop, and by the kernel if the process dies.
#[derive(Debug)]
pub struct StateLock {
    lock_file: File,
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, StateError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| StateError::LockFailed(format!("{}: {e}", lock_path.display())))?;
        Ok(Self {
            lock_file: file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, StateError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                lock_file: file,
                path: lock_path.to_path_buf(),
            })),
            Err(_) => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, StateError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    Ok(file)
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use std::time::{Duration, Instant};

    #[test]
    fn held_lock_keeps_state_closed() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let owner = StateLock::acquire(&dir.path().join("state.json.lock")).unwrap();

        assert!(matches!(
            State::open(&state_path),
            Err(StateError::LockFailed(_))
        ));
        drop(owner);
        assert!(State::open(&state_path).is_ok());
    }

    #[test]
    fn open_state_holds_its_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let _state = State::open(dir.path().join("state.json")).unwrap();
        let lock_path = dir.path().join("state.json.lock");
        assert!(StateLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn acquire_waits_for_the_previous_owner() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("var").join("state.json.lock");
        let owner = StateLock::try_acquire(&lock_path).unwrap().unwrap();
        assert_eq!(owner.path(), lock_path.as_path());

        let start = Instant::now();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(owner);
        });
        let next = StateLock::acquire(&lock_path).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        releaser.join().unwrap();
        drop(next);
    }
}
