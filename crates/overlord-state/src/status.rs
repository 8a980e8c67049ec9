use crate::StateError;
use serde::{Deserialize, Serialize};

/// Lifecycle status shared by tasks and (derived) by changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Status {
    Do,
    Doing,
    Done,
    Abort,
    Undo,
    Undoing,
    Undone,
    Error,
    Hold,
    Wait,
}

impl Status {
    /// Terminal statuses never transition again, except `Done` which may be
    /// queued for undo by a cascade.
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Done | Status::Undone | Status::Error)
    }

    /// True when the status can still end in `Done`.
    pub fn may_complete(self) -> bool {
        matches!(
            self,
            Status::Do | Status::Doing | Status::Done | Status::Wait | Status::Hold
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Do => write!(f, "do"),
            Status::Doing => write!(f, "doing"),
            Status::Done => write!(f, "done"),
            Status::Abort => write!(f, "abort"),
            Status::Undo => write!(f, "undo"),
            Status::Undoing => write!(f, "undoing"),
            Status::Undone => write!(f, "undone"),
            Status::Error => write!(f, "error"),
            Status::Hold => write!(f, "hold"),
            Status::Wait => write!(f, "wait"),
        }
    }
}

pub fn validate_transition(from: Status, to: Status) -> Result<(), StateError> {
    if from == to {
        return Ok(());
    }
    let valid = matches!(
        (from, to),
        (
            Status::Do,
            Status::Doing | Status::Wait | Status::Hold | Status::Undo | Status::Undone | Status::Error
        ) | (
            Status::Wait,
            Status::Do | Status::Doing | Status::Hold | Status::Undo | Status::Undone
        ) | (Status::Hold, Status::Do | Status::Undo | Status::Undone)
            | (
                Status::Doing,
                Status::Do | Status::Done | Status::Error | Status::Abort | Status::Undo
            )
            | (Status::Abort, Status::Undo | Status::Undone | Status::Error)
            | (Status::Done, Status::Undo)
            | (
                Status::Undo,
                Status::Undoing | Status::Undone | Status::Error
            )
            | (
                Status::Undoing,
                Status::Undo | Status::Undone | Status::Error
            )
    );

    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
