//! Quorum tracking for a single (instance, phase) attempt.

use std::collections::BTreeSet;

use crate::types::AcceptorId;

/// Set of acceptors that voted in the current attempt plus the threshold
/// needed to proceed.
///
/// Votes from a superseded ballot never count toward a later one, so callers
/// [`clear`](Self::clear) (or replace) the tracker on every new attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Quorum {
    voters: BTreeSet<AcceptorId>,
    threshold: usize,
}

impl Quorum {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            voters: BTreeSet::new(),
            threshold,
        }
    }

    /// Record a vote. Returns `true` if `aid` had not voted yet.
    pub fn add(&mut self, aid: AcceptorId) -> bool {
        self.voters.insert(aid)
    }

    /// Whether at least `threshold` distinct acceptors voted.
    #[must_use]
    pub fn reached(&self) -> bool {
        self.voters.len() >= self.threshold
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.voters.len()
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Forget every vote, keeping the threshold.
    pub fn clear(&mut self) {
        self.voters.clear();
    }

    /// Forget every vote and switch to a new threshold.
    pub fn reset(&mut self, threshold: usize) {
        self.voters.clear();
        self.threshold = threshold;
    }
}
