use crate::backend::{Backend, FileBackend, MemoryBackend};
use crate::document::Document;
use crate::lock::StateLock;
use crate::StateError;
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const CHECKSUM_KEY: &str = "checksum";

/// Wake-up channel between state mutations and the ensure loop.
///
/// Requests coalesce: only the earliest pending deadline is kept.
#[derive(Debug, Default)]
pub struct EnsureSignal {
    next: Mutex<Option<Instant>>,
    cv: Condvar,
}

impl EnsureSignal {
    /// Ask for an ensure pass no later than `delay` from now.
    pub fn ensure_before(&self, delay: Duration) {
        let at = Instant::now() + delay;
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        if next.map_or(true, |current| at < current) {
            *next = Some(at);
        }
        self.cv.notify_all();
    }

    /// Block until a requested deadline passes or `timeout` elapses.
    ///
    /// Returns true when woken by a request, consuming it.
    pub fn wait(&self, timeout: Duration) -> bool {
        let limit = Instant::now() + timeout;
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let now = Instant::now();
            if let Some(at) = *next {
                if at <= now {
                    *next = None;
                    return true;
                }
            }
            if now >= limit {
                return false;
            }
            let until = next.map_or(limit, |at| at.min(limit));
            let (guard, _) = self
                .cv
                .wait_timeout(next, until - now)
                .unwrap_or_else(PoisonError::into_inner);
            next = guard;
        }
    }

    pub fn pending(&self) -> Option<Instant> {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    doc: Mutex<Document>,
    backend: Box<dyn Backend>,
    ensure: EnsureSignal,
    _owner: Option<StateLock>,
}

/// Shared handle to the state document.
///
/// Cloning is cheap and every clone refers to the same document. There is no
/// ambient instance: components receive the handle explicitly.
#[derive(Clone)]
pub struct State {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("location", &self.inner.backend.location())
            .finish_non_exhaustive()
    }
}

impl State {
    /// Open (or create) the state file at `path`, taking process ownership
    /// through `<path>.lock`.
    ///
    /// Fails with [`StateError::Corrupt`] when the file cannot be decoded;
    /// callers must refuse to run the engine in that case.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path: PathBuf = path.into();
        let lock_path = lock_path_for(&path);
        let owner = StateLock::try_acquire(&lock_path)?.ok_or_else(|| {
            StateError::LockFailed(format!(
                "{} is owned by another process",
                lock_path.display()
            ))
        })?;
        Self::build(Box::new(FileBackend::new(path)), Some(owner))
    }

    /// Load from an arbitrary backend.
    pub fn with_backend(backend: impl Backend + 'static) -> Result<Self, StateError> {
        Self::build(Box::new(backend), None)
    }

    /// Fresh, empty, memory-backed state.
    pub fn in_memory() -> Self {
        Self::from_document(Box::new(MemoryBackend::new()), Document::default(), None)
    }

    fn build(backend: Box<dyn Backend>, owner: Option<StateLock>) -> Result<Self, StateError> {
        let location = backend.location();
        let doc = match backend.load()? {
            Some(bytes) => decode(&bytes, &location)?,
            None => {
                info!("no state at {}, starting empty", location.display());
                Document::default()
            }
        };
        Ok(Self::from_document(backend, doc, owner))
    }

    fn from_document(backend: Box<dyn Backend>, doc: Document, owner: Option<StateLock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                doc: Mutex::new(doc),
                backend,
                ensure: EnsureSignal::default(),
                _owner: owner,
            }),
        }
    }

    /// Acquire exclusive access to the document.
    ///
    /// Not re-entrant: a thread already holding a guard must not call this.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            state: self,
            doc: self.inner.doc.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn ensure_before(&self, delay: Duration) {
        self.inner.ensure.ensure_before(delay);
    }

    pub fn ensure_signal(&self) -> &EnsureSignal {
        &self.inner.ensure
    }

    pub fn location(&self) -> PathBuf {
        self.inner.backend.location()
    }

    pub fn same_as(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "state".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!("{name}.lock"))
}

/// Exclusive access to the document.
///
/// Mutable access marks the document dirty; dropping a guard over a dirty
/// document checkpoints it. Use [`StateGuard::unlock`] to observe the
/// checkpoint result instead of having it logged.
pub struct StateGuard<'a> {
    state: &'a State,
    doc: MutexGuard<'a, Document>,
}

impl<'a> StateGuard<'a> {
    /// The handle this guard was taken from.
    pub fn state(&self) -> &'a State {
        self.state
    }

    /// Persist the document if it changed since the last checkpoint.
    pub fn checkpoint(&mut self) -> Result<(), StateError> {
        if !self.doc.is_modified() {
            return Ok(());
        }
        let bytes = encode(&self.doc)?;
        self.state.inner.backend.checkpoint(&bytes)?;
        self.doc.set_modified(false);
        Ok(())
    }

    /// Checkpoint and release the lock.
    pub fn unlock(mut self) -> Result<(), StateError> {
        self.checkpoint()
    }

    pub fn is_dirty(&self) -> bool {
        self.doc.is_modified()
    }
}

impl Deref for StateGuard<'_> {
    type Target = Document;

    fn deref(&self) -> &Document {
        &self.doc
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut Document {
        self.doc.set_modified(true);
        &mut self.doc
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if self.doc.is_modified() {
            if let Err(e) = self.checkpoint() {
                error!(
                    "cannot checkpoint state to {}: {e}",
                    self.state.location().display()
                );
            }
        }
    }
}

/// Serialize a document, embedding a blake3 checksum over the canonical
/// (sorted-key) encoding of everything else.
pub fn encode(doc: &Document) -> Result<Vec<u8>, StateError> {
    let mut value = serde_json::to_value(doc)?;
    let canonical = serde_json::to_vec(&value)?;
    let sum = blake3::hash(&canonical).to_hex().to_string();
    if let Value::Object(map) = &mut value {
        map.insert(CHECKSUM_KEY.to_owned(), Value::String(sum));
    }
    Ok(serde_json::to_vec(&value)?)
}

/// Decode and verify persisted bytes.
pub fn decode(bytes: &[u8], location: &Path) -> Result<Document, StateError> {
    let corrupt = |reason: String| StateError::Corrupt {
        path: location.to_path_buf(),
        reason,
    };

    let mut value: Value =
        serde_json::from_slice(bytes).map_err(|e| corrupt(format!("unparseable: {e}")))?;
    let Value::Object(map) = &mut value else {
        return Err(corrupt("top level is not an object".to_owned()));
    };
    match map.remove(CHECKSUM_KEY) {
        Some(Value::String(expected)) => {
            let canonical = serde_json::to_vec(&value)?;
            let actual = blake3::hash(&canonical).to_hex().to_string();
            if actual != expected {
                return Err(corrupt(format!(
                    "checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }
        Some(other) => return Err(corrupt(format!("invalid checksum field: {other}"))),
        // Legacy documents carry no checksum.
        None => {}
    }

    let mut doc: Document =
        serde_json::from_value(value).map_err(|e| corrupt(format!("invalid document: {e}")))?;
    doc.verify_references().map_err(corrupt)?;
    if doc.repair_counters() {
        warn!(
            "id counters in {} were behind stored ids; repaired",
            location.display()
        );
        doc.set_modified(true);
    }
    Ok(doc)
}
