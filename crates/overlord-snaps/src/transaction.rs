use crate::SnapError;
use overlord_state::{Document, LaneId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the task sets of a multi-snap request are grouped for rollback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transaction {
    /// No lane: every task rolls back on its own, within the implicit lane.
    #[default]
    None,
    /// One fresh lane per snap.
    PerSnap,
    /// One lane shared by every snap of the request.
    AllSnaps,
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transaction::None => f.write_str(""),
            Transaction::PerSnap => f.write_str("per-snap"),
            Transaction::AllSnaps => f.write_str("all-snaps"),
        }
    }
}

impl FromStr for Transaction {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Transaction::None),
            "per-snap" => Ok(Transaction::PerSnap),
            "all-snaps" => Ok(Transaction::AllSnaps),
            other => Err(SnapError::UnknownTransaction(other.to_owned())),
        }
    }
}

/// Request options that affect lane assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub transaction: Transaction,
    /// Shared lane for [`Transaction::AllSnaps`]. Allocated when left unset.
    pub lane: LaneId,
}

impl Default for Flags {
    fn default() -> Self {
        Self::new(Transaction::None)
    }
}

impl Flags {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            lane: LaneId::NONE,
        }
    }

    /// Reject a lane without `AllSnaps`, and allocate the shared lane when
    /// `AllSnaps` has none yet.
    pub fn set_default_lane(&mut self, doc: &mut Document) -> Result<(), SnapError> {
        if self.transaction != Transaction::AllSnaps && !self.lane.is_none() {
            return Err(SnapError::LaneWithoutTransaction);
        }
        if self.transaction == Transaction::AllSnaps && self.lane.is_none() {
            self.lane = doc.new_lane();
        }
        Ok(())
    }

    /// Lane for the next snap's task set.
    pub fn generate_lane(&self, doc: &mut Document) -> LaneId {
        match self.transaction {
            Transaction::AllSnaps => self.lane,
            Transaction::PerSnap => doc.new_lane(),
            Transaction::None => LaneId::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_requires_all_snaps() {
        let mut doc = Document::default();
        let lane = doc.new_lane();
        for transaction in [Transaction::None, Transaction::PerSnap] {
            let mut flags = Flags {
                transaction,
                lane,
            };
            assert!(matches!(
                flags.set_default_lane(&mut doc),
                Err(SnapError::LaneWithoutTransaction)
            ));
        }
    }

    #[test]
    fn all_snaps_allocates_one_shared_lane() {
        let mut doc = Document::default();
        let mut flags = Flags::new(Transaction::AllSnaps);
        flags.set_default_lane(&mut doc).unwrap();
        assert!(!flags.lane.is_none());
        let first = flags.generate_lane(&mut doc);
        let second = flags.generate_lane(&mut doc);
        assert_eq!(first, flags.lane);
        assert_eq!(first, second);
    }

    #[test]
    fn all_snaps_keeps_a_supplied_lane() {
        let mut doc = Document::default();
        let lane = doc.new_lane();
        let mut flags = Flags {
            transaction: Transaction::AllSnaps,
            lane,
        };
        flags.set_default_lane(&mut doc).unwrap();
        assert_eq!(flags.lane, lane);
        assert_eq!(doc.last_lane_id(), 1);
    }

    #[test]
    fn per_snap_lanes_are_fresh() {
        let mut doc = Document::default();
        let mut flags = Flags::new(Transaction::PerSnap);
        flags.set_default_lane(&mut doc).unwrap();
        let a = flags.generate_lane(&mut doc);
        let b = flags.generate_lane(&mut doc);
        assert_ne!(a, b);
        assert!(!a.is_none() && !b.is_none());
    }

    #[test]
    fn no_transaction_means_no_lane() {
        let mut doc = Document::default();
        let flags = Flags::default();
        assert!(flags.generate_lane(&mut doc).is_none());
        assert_eq!(doc.last_lane_id(), 0);
    }

    #[test]
    fn transaction_names_parse() {
        assert_eq!("all-snaps".parse::<Transaction>().unwrap(), Transaction::AllSnaps);
        assert_eq!("per-snap".parse::<Transaction>().unwrap(), Transaction::PerSnap);
        assert_eq!("".parse::<Transaction>().unwrap(), Transaction::None);
        assert!("everything".parse::<Transaction>().is_err());
        assert_eq!(Transaction::PerSnap.to_string(), "per-snap");
    }
}
