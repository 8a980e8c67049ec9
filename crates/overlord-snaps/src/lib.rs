//! Snap lifecycle on top of the overlord engine.
//!
//! `plan` turns install and remove requests into task sets, `transaction`
//! decides which lanes they join, `backend` performs the on-disk effects and
//! `handlers` binds the two to task kinds in a `HandlerRegistry`.

pub mod backend;
pub mod handlers;
pub mod plan;
pub mod transaction;

pub use backend::{LinkBackend, SnapSetup};
pub use handlers::register_handlers;
pub use plan::{install, install_many, remove};
pub use transaction::{Flags, Transaction};

use overlord_engine::{EngineError, TaskError};
use overlord_state::StateError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("snap I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid snap name {0:?}")]
    InvalidName(String),
    #[error("cannot link snap {0:?} with unset revision")]
    UnsetRevision(String),
    #[error("revision {revision} of snap {name:?} is not mounted at {}", .path.display())]
    MissingRevision {
        name: String,
        revision: u32,
        path: PathBuf,
    },
    #[error("cannot find snap file {}", .0.display())]
    MissingBlob(PathBuf),
    #[error("current link of snap {name:?} has unexpected target {target:?}")]
    BadLink { name: String, target: String },
    #[error("snap {0:?} is not installed")]
    NotInstalled(String),
    #[error("cannot specify a lane without setting transaction to \"all-snaps\"")]
    LaneWithoutTransaction,
    #[error("unknown transaction {0:?}")]
    UnknownTransaction(String),
}

impl SnapError {
    /// Failures that may clear up by themselves.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SnapError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            )
        )
    }
}

impl From<SnapError> for TaskError {
    fn from(e: SnapError) -> Self {
        if e.is_transient() {
            TaskError::retry(e.to_string())
        } else {
            TaskError::fatal(e)
        }
    }
}

/// Snap names: lowercase letters, digits and dashes, starting with a letter,
/// no leading, trailing or doubled dash.
pub fn validate_name(name: &str) -> Result<(), SnapError> {
    let valid = !name.is_empty()
        && name.len() <= 40
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && !name.contains("--")
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SnapError::InvalidName(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        for good in ["hello", "core22", "go-lang"] {
            assert!(validate_name(good).is_ok(), "{good}");
        }
        for bad in ["", "Hello", "-x", "x-", "a--b", "../etc", "9lives"] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn transient_io_errors_retry() {
        let e = SnapError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted));
        assert!(matches!(TaskError::from(e), TaskError::Retry { .. }));
        let e = SnapError::UnsetRevision("foo".to_owned());
        assert_eq!(
            TaskError::from(e),
            TaskError::Fatal("cannot link snap \"foo\" with unset revision".to_owned())
        );
    }
}
