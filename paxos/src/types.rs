//! Core value types shared by every role: ballots, values and accepted records.

use core::fmt;

use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifier of a consensus instance (one slot of the replicated log).
pub type InstanceId = u64;

/// Identifier of an acceptor.
pub type AcceptorId = u32;

/// Identifier of a proposer.
pub type ProposerId = u32;

/// Ordering key for proposals - compares by (number, proposer).
///
/// The derived ordering is lexicographic over the field order, so two
/// proposers never produce equal ballots as long as their ids differ.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ballot {
    /// Attempt number, bumped on every preemption
    pub number: u32,
    /// Proposer that owns this ballot
    pub proposer: ProposerId,
}

impl Ballot {
    /// The lowest ballot. Stored as `value_ballot` when nothing was accepted.
    pub const ZERO: Self = Self {
        number: 0,
        proposer: 0,
    };

    #[must_use]
    pub const fn new(number: u32, proposer: ProposerId) -> Self {
        Self { number, proposer }
    }

    /// First ballot a proposer uses for a fresh instance.
    #[must_use]
    pub const fn initial(proposer: ProposerId) -> Self {
        Self::new(0, proposer)
    }

    /// Smallest ballot owned by `self.proposer` that is strictly greater than
    /// both `self` and `seen`.
    #[must_use]
    pub fn next_after(self, seen: Ballot) -> Self {
        let number = self.number.max(seen.number).saturating_add(1);
        Self::new(number, self.proposer)
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.number, self.proposer)
    }
}

/// Opaque value payload.
///
/// Cloning is cheap (reference counted). An empty value is valid and marks
/// the absence of an accepted value.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Value(Bytes);

impl Value {
    #[must_use]
    pub const fn empty() -> Self {
        Self(Bytes::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Durable per-(acceptor, instance) state.
///
/// `value_ballot <= ballot` always holds. A record with an empty value has
/// promised `ballot` but accepted nothing yet.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AcceptedRecord {
    pub aid: AcceptorId,
    pub iid: InstanceId,
    /// Highest ballot promised or accepted
    pub ballot: Ballot,
    /// Ballot at which `value` was accepted
    pub value_ballot: Ballot,
    pub value: Value,
}

impl AcceptedRecord {
    /// A record that promised `ballot` without accepting anything.
    #[must_use]
    pub fn promised(aid: AcceptorId, iid: InstanceId, ballot: Ballot) -> Self {
        Self {
            aid,
            iid,
            ballot,
            value_ballot: Ballot::ZERO,
            value: Value::empty(),
        }
    }

    /// A record that accepted `value` at `ballot`.
    #[must_use]
    pub fn accepted(aid: AcceptorId, iid: InstanceId, ballot: Ballot, value: Value) -> Self {
        Self {
            aid,
            iid,
            ballot,
            value_ballot: ballot,
            value,
        }
    }

    /// Whether this record holds an accepted value.
    #[must_use]
    pub fn has_value(&self) -> bool {
        !self.value.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballot_orders_by_number_then_proposer() {
        assert!(Ballot::new(0, 2) > Ballot::new(0, 1));
        assert!(Ballot::new(1, 1) > Ballot::new(0, 2));
        assert!(Ballot::new(1, 0) > Ballot::new(0, 9));
        assert_eq!(Ballot::new(3, 4), Ballot::new(3, 4));
        assert!(Ballot::ZERO <= Ballot::initial(0));
    }

    #[test]
    fn next_after_is_strictly_greater_than_both() {
        let mine = Ballot::initial(1);
        let seen = Ballot::new(0, 2);
        let next = mine.next_after(seen);
        assert_eq!(next, Ballot::new(1, 1));
        assert!(next > mine);
        assert!(next > seen);

        let next = Ballot::new(1, 1).next_after(Ballot::new(7, 3));
        assert_eq!(next, Ballot::new(8, 1));
    }

    #[test]
    fn empty_value_marks_absence() {
        let record = AcceptedRecord::promised(0, 1, Ballot::initial(1));
        assert!(!record.has_value());
        assert_eq!(record.value_ballot, Ballot::ZERO);

        let record = AcceptedRecord::accepted(0, 1, Ballot::initial(1), Value::from("x"));
        assert!(record.has_value());
        assert_eq!(record.value_ballot, record.ballot);
    }
}
