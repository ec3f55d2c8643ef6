//! Per-instance proposer bookkeeping.

use std::time::Instant;

use crate::quorum::Quorum;
use crate::types::{Ballot, InstanceId, Value};

/// An instance this proposer is driving, in either phase.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Instance {
    pub(crate) iid: InstanceId,
    pub(crate) ballot: Ballot,
    /// Our own candidate value
    pub(crate) value: Value,
    /// Highest-ballot value disclosed by a promise, overrides `value`
    pub(crate) promised: Option<(Ballot, Value)>,
    pub(crate) quorum: Quorum,
    pub(crate) created_at: Instant,
    /// Phase 1 restarts after preemption
    pub(crate) retries: u32,
}

impl Instance {
    pub(crate) fn new(
        iid: InstanceId,
        ballot: Ballot,
        value: Value,
        threshold: usize,
        now: Instant,
    ) -> Self {
        Self {
            iid,
            ballot,
            value,
            promised: None,
            quorum: Quorum::new(threshold),
            created_at: now,
            retries: 0,
        }
    }

    /// Value to send in phase 2.
    pub(crate) fn proposal(&self) -> &Value {
        self.promised.as_ref().map_or(&self.value, |(_, v)| v)
    }

    /// Adopt `value` if it was accepted at a higher ballot than anything
    /// adopted so far. Empty values carry nothing to adopt.
    pub(crate) fn adopt(&mut self, value_ballot: Ballot, value: &Value) -> bool {
        if value.is_empty() {
            return false;
        }
        if self
            .promised
            .as_ref()
            .is_some_and(|(held, _)| value_ballot <= *held)
        {
            return false;
        }
        self.promised = Some((value_ballot, value.clone()));
        true
    }

    /// Start a new attempt at `ballot` in phase 1.
    pub(crate) fn restart(&mut self, ballot: Ballot, threshold: usize, now: Instant) {
        self.ballot = ballot;
        self.promised = None;
        self.quorum.reset(threshold);
        self.created_at = now;
        self.retries = self.retries.saturating_add(1);
    }

    /// Whether our own value lost to an adopted one.
    pub(crate) fn own_value_displaced(&self) -> bool {
        self.promised.as_ref().is_some_and(|(_, v)| *v != self.value)
    }

    pub(crate) fn expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= timeout
    }
}
