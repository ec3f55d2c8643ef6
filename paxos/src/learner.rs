//! Learner: turns accepted acks into an in-order stream of chosen values.
//!
//! An instance closes when `quorum` acceptors report the same value ballot.
//! Closed instances are delivered strictly in instance order. Gaps are
//! reported by [`Learner::has_holes`] so a collaborator can ask acceptors to
//! repeat them.

use std::collections::BTreeMap;

use error_stack::Report;
use tracing::{debug, trace};

use crate::config::LearnerConfig;
use crate::error::ConfigError;
use crate::messages::{Accepted, Chosen, Envelope, Repeat, Trim};
use crate::types::{AcceptorId, Ballot, InstanceId, Value};

/// Receives chosen values in instance order.
pub trait Deliver {
    fn deliver(&mut self, iid: InstanceId, value: Value);
}

impl<F> Deliver for F
where
    F: FnMut(InstanceId, Value),
{
    fn deliver(&mut self, iid: InstanceId, value: Value) {
        self(iid, value);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
struct Slot {
    /// Highest-ballot ack per acceptor
    acks: BTreeMap<AcceptorId, (Ballot, Ballot, Value)>,
    closed: Option<Value>,
}

impl Slot {
    /// Record `ack`, returning the value if this closes the slot.
    fn update(&mut self, ack: &Accepted, quorum: usize) -> Option<&Value> {
        let newer = self
            .acks
            .get(&ack.aid)
            .is_none_or(|(ballot, _, _)| ack.ballot > *ballot);
        if !newer {
            return None;
        }
        self.acks
            .insert(ack.aid, (ack.ballot, ack.value_ballot, ack.value.clone()));
        let matching = self
            .acks
            .values()
            .filter(|(_, value_ballot, _)| *value_ballot == ack.value_ballot)
            .count();
        if matching >= quorum {
            self.closed = Some(ack.value.clone());
            self.acks.clear();
        }
        self.closed.as_ref()
    }
}

/// A Paxos learner.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Learner {
    config: LearnerConfig,
    /// Next instance to deliver
    current_iid: InstanceId,
    highest_iid_closed: InstanceId,
    /// False until the first ack when not catching up
    started: bool,
    slots: BTreeMap<InstanceId, Slot>,
}

impl Learner {
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(config: LearnerConfig) -> Result<Self, Report<ConfigError>> {
        config.validate()?;
        Ok(Self {
            started: config.catch_up,
            config,
            current_iid: 1,
            highest_iid_closed: 0,
            slots: BTreeMap::new(),
        })
    }

    /// Next instance that will be delivered.
    #[must_use]
    pub fn current_instance(&self) -> InstanceId {
        self.current_iid
    }

    /// Highest instance known closed.
    #[must_use]
    pub fn highest_closed(&self) -> InstanceId {
        self.highest_iid_closed
    }

    fn in_window(&self, iid: InstanceId) -> bool {
        let window = u64::try_from(self.config.instances).unwrap_or(u64::MAX);
        iid >= self.current_iid && iid - self.current_iid < window
    }

    fn start_at(&mut self, iid: InstanceId) {
        if !self.started {
            debug!(iid, "learner starting late");
            self.current_iid = iid;
            self.started = true;
        }
    }

    fn close(&mut self, iid: InstanceId) {
        self.highest_iid_closed = self.highest_iid_closed.max(iid);
        debug!(iid, "instance closed");
    }

    /// Record an accepted ack. Returns whether it closed its instance.
    pub fn receive_accepted(&mut self, ack: &Accepted) -> bool {
        self.start_at(ack.iid);
        if !self.in_window(ack.iid) {
            trace!(iid = ack.iid, current = self.current_iid, "accepted outside window");
            return false;
        }
        let slot = self.slots.entry(ack.iid).or_default();
        if slot.closed.is_some() {
            return false;
        }
        let closed = slot.update(ack, self.config.quorum).is_some();
        if closed {
            self.close(ack.iid);
        }
        closed
    }

    /// Close an instance directly from a chosen notification.
    pub fn receive_chosen(&mut self, chosen: &Chosen) -> bool {
        self.start_at(chosen.iid);
        if !self.in_window(chosen.iid) {
            return false;
        }
        let slot = self.slots.entry(chosen.iid).or_default();
        if slot.closed.is_some() {
            return false;
        }
        slot.closed = Some(chosen.value.clone());
        slot.acks.clear();
        self.close(chosen.iid);
        true
    }

    /// Skip every instance up to and including `trim.iid`.
    pub fn receive_trim(&mut self, trim: &Trim) {
        if trim.iid < self.current_iid {
            return;
        }
        self.current_iid = trim.iid.saturating_add(1);
        self.slots = self.slots.split_off(&self.current_iid);
        self.started = true;
        trace!(current = self.current_iid, "learner skipped trimmed instances");
    }

    /// Pop the next instance if it is closed.
    pub fn deliver_next(&mut self) -> Option<(InstanceId, Value)> {
        let iid = self.current_iid;
        let value = self.slots.get(&iid)?.closed.clone()?;
        self.slots.remove(&iid);
        self.current_iid += 1;
        Some((iid, value))
    }

    /// Deliver every instance that can be delivered in order. Returns how
    /// many were delivered.
    pub fn deliver(&mut self, sink: &mut impl Deliver) -> usize {
        let mut delivered = 0;
        while let Some((iid, value)) = self.deliver_next() {
            sink.deliver(iid, value);
            delivered += 1;
        }
        delivered
    }

    /// Range of instances blocking delivery, if closed instances exist past
    /// the next undelivered one.
    #[must_use]
    pub fn has_holes(&self) -> Option<(InstanceId, InstanceId)> {
        (self.highest_iid_closed > self.current_iid)
            .then_some((self.current_iid, self.highest_iid_closed))
    }

    /// Repeat request covering [`has_holes`](Self::has_holes), for all acceptors.
    #[must_use]
    pub fn repeat_request(&self) -> Option<Envelope> {
        self.has_holes()
            .map(|(from, to)| Envelope::acceptors(Repeat { from, to }))
    }
}
