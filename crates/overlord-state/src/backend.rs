use crate::{fsync_dir, StateError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

/// Where checkpoints go.
pub trait Backend: Send + Sync {
    /// Return the last checkpointed bytes, or `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<Vec<u8>>, StateError>;

    /// Atomically replace the persisted document with `data`.
    fn checkpoint(&self, data: &[u8]) -> Result<(), StateError>;

    /// Human-readable location used in error messages.
    fn location(&self) -> PathBuf;
}

/// Single-file backend: write to a temp file in the same directory, fsync,
/// rename over the target, fsync the directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl Backend for FileBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StateError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Io(e)),
        }
    }

    fn checkpoint(&self, data: &[u8]) -> Result<(), StateError> {
        let dir = self.dir();
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StateError::Io(e.error))?;
        fsync_dir(&dir)?;
        debug!("checkpointed {} bytes to {}", data.len(), self.path.display());
        Ok(())
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

/// In-memory backend that keeps every checkpoint, for tests and tooling.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    last: Mutex<Option<Vec<u8>>>,
    count: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend as if `data` had been checkpointed by a previous run.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            last: Mutex::new(Some(data)),
            count: AtomicUsize::new(0),
        }
    }

    pub fn checkpoints(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last_checkpoint(&self) -> Option<Vec<u8>> {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Backend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.last_checkpoint())
    }

    fn checkpoint(&self, data: &[u8]) -> Result<(), StateError> {
        *self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(data.to_vec());
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }
}

impl<B: Backend + ?Sized> Backend for std::sync::Arc<B> {
    fn load(&self) -> Result<Option<Vec<u8>>, StateError> {
        (**self).load()
    }

    fn checkpoint(&self, data: &[u8]) -> Result<(), StateError> {
        (**self).checkpoint(data)
    }

    fn location(&self) -> PathBuf {
        (**self).location()
    }
}
