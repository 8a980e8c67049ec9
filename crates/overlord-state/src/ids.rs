//! Newtype wrappers for numeric identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain integers so the on-disk document
//! stays readable by tooling that knows nothing about the wrappers.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a [`Task`](crate::Task). Allocated from `last_task_id`.
    TaskId
);

numeric_id!(
    /// Identifier of a [`Change`](crate::Change). Allocated from `last_change_id`.
    ChangeId
);

numeric_id!(
    /// Transactional grouping tag. [`LaneId::NONE`] is the implicit lane of
    /// tasks that never joined one.
    LaneId
);

impl LaneId {
    pub const NONE: LaneId = LaneId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}
