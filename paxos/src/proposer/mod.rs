//! Proposer state machine.
//!
//! Drives instances through phase 1 (prepare/promise) and phase 2
//! (accept/accepted). Pure and clock-free: every operation that stamps or
//! compares instance ages takes `now`, and retransmission happens only when
//! the caller asks for [`Proposer::timeouts`].
//!
//! Every [`Prepare`] and [`Accept`] returned here is addressed to all
//! acceptors.

mod instance;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use error_stack::Report;
use tracing::{debug, trace};

use self::instance::Instance;
use crate::carray::RingBuffer;
use crate::config::ProposerConfig;
use crate::error::{ConfigError, PendingFull};
use crate::messages::{
    Accept, Accepted, AcceptorState, Chosen, Message, Preempted, Prepare, Promise, Trim,
};
use crate::types::{Ballot, InstanceId, ProposerId, Value};

/// A Paxos proposer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Proposer {
    id: ProposerId,
    config: ProposerConfig,
    pending: RingBuffer<Value>,
    next_prepare_iid: InstanceId,
    max_trim_iid: InstanceId,
    /// Instances in phase 1
    preparing: BTreeMap<InstanceId, Instance>,
    /// Instances in phase 2
    accepting: BTreeMap<InstanceId, Instance>,
    /// Instances known chosen above the watermark
    chosen: BTreeSet<InstanceId>,
}

impl Proposer {
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails
    /// [`validate`](ProposerConfig::validate).
    pub fn new(id: ProposerId, config: ProposerConfig) -> Result<Self, Report<ConfigError>> {
        config.validate()?;
        debug!(
            proposer = id,
            acceptors = config.acceptors,
            q1 = config.q1,
            q2 = config.q2,
            "proposer started"
        );
        Ok(Self {
            id,
            pending: RingBuffer::with_capacity(config.pending_capacity.min(1024)),
            config,
            next_prepare_iid: 1,
            max_trim_iid: 0,
            preparing: BTreeMap::new(),
            accepting: BTreeMap::new(),
            chosen: BTreeSet::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> ProposerId {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &ProposerConfig {
        &self.config
    }

    /// Instances waiting for a phase 1 quorum.
    #[must_use]
    pub fn prepared_count(&self) -> usize {
        self.preparing.len()
    }

    /// Instances waiting for a phase 2 quorum.
    #[must_use]
    pub fn accepting_count(&self) -> usize {
        self.accepting.len()
    }

    /// Values not yet assigned to an instance.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Lowest instance id the next [`try_prepare`](Self::try_prepare) may use.
    #[must_use]
    pub fn next_instance(&self) -> InstanceId {
        self.next_prepare_iid.max(self.max_trim_iid.saturating_add(1))
    }

    #[must_use]
    pub fn max_trim_iid(&self) -> InstanceId {
        self.max_trim_iid
    }

    fn in_flight(&self) -> usize {
        self.preparing.len() + self.accepting.len()
    }

    fn is_closed(&self, iid: InstanceId) -> bool {
        iid <= self.max_trim_iid || self.chosen.contains(&iid)
    }

    /// Queue `value` for a future instance.
    ///
    /// # Errors
    ///
    /// Hands `value` back in [`PendingFull`] when the queue is at capacity.
    pub fn propose(&mut self, value: Value) -> Result<(), PendingFull> {
        if self.pending.len() >= self.config.pending_capacity {
            trace!(proposer = self.id, pending = self.pending.len(), "pending queue full");
            return Err(PendingFull(value));
        }
        self.pending.push_back(value);
        Ok(())
    }

    /// Open the next instance for the oldest pending value.
    ///
    /// Returns `None` when nothing is pending or the window is full.
    pub fn try_prepare(&mut self, now: Instant) -> Option<Prepare> {
        if self.in_flight() >= self.config.preexec_window {
            return None;
        }
        let value = self.pending.pop_front()?;
        let mut iid = self.next_instance();
        while self.is_closed(iid)
            || self.preparing.contains_key(&iid)
            || self.accepting.contains_key(&iid)
        {
            iid += 1;
        }
        self.next_prepare_iid = iid + 1;

        let ballot = Ballot::initial(self.id);
        self.preparing
            .insert(iid, Instance::new(iid, ballot, value, self.config.q1, now));
        debug!(proposer = self.id, iid, %ballot, "preparing");
        Some(Prepare { iid, ballot })
    }

    /// Open as many instances as the window allows.
    pub fn prepare_all(&mut self, now: Instant) -> Vec<Prepare> {
        std::iter::from_fn(|| self.try_prepare(now)).collect()
    }

    /// Restart `iid` in phase 1 at a ballot above `seen`.
    fn preempt(&mut self, iid: InstanceId, seen: Ballot, now: Instant) -> Option<Prepare> {
        let mut inst = match self.preparing.remove(&iid) {
            Some(inst) => inst,
            None => self.accepting.remove(&iid)?,
        };
        let old = inst.ballot;
        let ballot = old.next_after(seen);
        inst.restart(ballot, self.config.q1, now);
        debug!(
            proposer = self.id,
            iid,
            %old,
            %seen,
            new = %ballot,
            retries = inst.retries,
            "preempted, retrying"
        );
        self.preparing.insert(iid, inst);
        Some(Prepare { iid, ballot })
    }

    /// Count a promise.
    ///
    /// Returns the [`Accept`] once `q1` acceptors promised, or a retry
    /// [`Prepare`] if the promise carries a higher ballot than ours.
    pub fn receive_promise(&mut self, promise: &Promise, now: Instant) -> Option<Message> {
        let iid = promise.iid;
        if self.is_closed(iid) {
            trace!(proposer = self.id, iid, "promise for closed instance");
            return None;
        }
        let Some(inst) = self.preparing.get_mut(&iid) else {
            trace!(proposer = self.id, iid, "promise for instance not preparing");
            return None;
        };
        if promise.ballot > inst.ballot {
            return self.preempt(iid, promise.ballot, now).map(Message::from);
        }
        if promise.ballot < inst.ballot {
            trace!(
                proposer = self.id,
                iid,
                ballot = %promise.ballot,
                current = %inst.ballot,
                "stale promise"
            );
            return None;
        }
        if !inst.quorum.add(promise.aid) {
            trace!(proposer = self.id, iid, aid = promise.aid, "duplicate promise");
            return None;
        }
        if inst.adopt(promise.value_ballot, &promise.value) {
            debug!(
                proposer = self.id,
                iid,
                value_ballot = %promise.value_ballot,
                "adopted promised value"
            );
        }
        if !inst.quorum.reached() {
            return None;
        }

        let mut inst = self.preparing.remove(&iid)?;
        inst.quorum.reset(self.config.q2);
        inst.created_at = now;
        let accept = Accept {
            iid,
            ballot: inst.ballot,
            value: inst.proposal().clone(),
        };
        debug!(proposer = self.id, iid, ballot = %inst.ballot, "phase 1 complete, accepting");
        self.accepting.insert(iid, inst);
        Some(Message::Accept(accept))
    }

    /// Count an accepted ack. Returns [`Chosen`] once `q2` acceptors
    /// accepted our ballot.
    pub fn receive_accepted(&mut self, accepted: &Accepted) -> Option<Chosen> {
        let iid = accepted.iid;
        if self.is_closed(iid) {
            trace!(proposer = self.id, iid, "accepted for closed instance");
            return None;
        }
        let inst = self.accepting.get_mut(&iid)?;
        if accepted.ballot != inst.ballot {
            trace!(
                proposer = self.id,
                iid,
                ballot = %accepted.ballot,
                current = %inst.ballot,
                "accepted for other ballot"
            );
            return None;
        }
        inst.quorum.add(accepted.aid);
        if !inst.quorum.reached() {
            return None;
        }

        let inst = self.accepting.remove(&iid)?;
        let chosen = Chosen {
            iid,
            ballot: inst.ballot,
            value: inst.proposal().clone(),
        };
        self.retire(inst);
        debug!(proposer = self.id, iid, ballot = %chosen.ballot, "chosen");
        Some(chosen)
    }

    /// Mark an instance chosen, requeueing our value if another one won.
    fn retire(&mut self, inst: Instance) {
        if inst.own_value_displaced() {
            trace!(proposer = self.id, iid = inst.iid, "requeueing displaced value");
            self.pending.push_front(inst.value);
        }
        self.chosen.insert(inst.iid);
    }

    /// Handle a refused accept. Returns the retry [`Prepare`] if the refusal
    /// is for our current ballot.
    pub fn receive_preempted(&mut self, preempted: &Preempted, now: Instant) -> Option<Prepare> {
        let iid = preempted.iid;
        if self.is_closed(iid) {
            return None;
        }
        let current = self
            .preparing
            .get(&iid)
            .or_else(|| self.accepting.get(&iid))?
            .ballot;
        if preempted.ballot <= current {
            trace!(
                proposer = self.id,
                iid,
                ballot = %preempted.ballot,
                %current,
                "stale preempted"
            );
            return None;
        }
        self.preempt(iid, preempted.ballot, now)
    }

    /// Learn that `iid` was chosen elsewhere and stop driving it.
    pub fn receive_chosen(&mut self, chosen: &Chosen) {
        let iid = chosen.iid;
        if self.is_closed(iid) {
            return;
        }
        let inst = self
            .preparing
            .remove(&iid)
            .or_else(|| self.accepting.remove(&iid));
        match inst {
            Some(mut inst) => {
                // the chosen value is what matters, not what we adopted
                inst.promised = Some((chosen.ballot, chosen.value.clone()));
                self.retire(inst);
            }
            None => {
                self.chosen.insert(iid);
            }
        }
        trace!(proposer = self.id, iid, "learned chosen instance");
    }

    /// Raise the watermark. Instances at or below it are dropped without a
    /// completion notice and their values are not requeued.
    ///
    /// Returns whether the watermark moved.
    pub fn receive_trim(&mut self, trim: &Trim) -> bool {
        let iid = trim.iid;
        if iid <= self.max_trim_iid {
            return false;
        }
        self.max_trim_iid = iid;
        let keep = iid.saturating_add(1);
        let dropped = self.preparing.len() + self.accepting.len();
        self.preparing = self.preparing.split_off(&keep);
        self.accepting = self.accepting.split_off(&keep);
        self.chosen = self.chosen.split_off(&keep);
        let dropped = dropped - self.preparing.len() - self.accepting.len();
        debug!(proposer = self.id, trim_iid = iid, dropped, "trimmed");
        true
    }

    /// Treat an acceptor's status as a trim.
    pub fn receive_acceptor_state(&mut self, state: &AcceptorState) -> bool {
        self.receive_trim(&Trim {
            iid: state.trim_iid,
        })
    }

    /// Retransmit every instance older than the configured timeout, at its
    /// current ballot, and restart its clock.
    pub fn timeouts(&mut self, now: Instant) -> Vec<Message> {
        let timeout = self.config.timeout;
        let mut out = Vec::new();
        for inst in self.preparing.values_mut() {
            if inst.expired(now, timeout) {
                inst.created_at = now;
                trace!(
                    proposer = self.id,
                    iid = inst.iid,
                    ballot = %inst.ballot,
                    "prepare timed out"
                );
                out.push(Message::Prepare(Prepare {
                    iid: inst.iid,
                    ballot: inst.ballot,
                }));
            }
        }
        for inst in self.accepting.values_mut() {
            if inst.expired(now, timeout) {
                inst.created_at = now;
                trace!(
                    proposer = self.id,
                    iid = inst.iid,
                    ballot = %inst.ballot,
                    "accept timed out"
                );
                out.push(Message::Accept(Accept {
                    iid: inst.iid,
                    ballot: inst.ballot,
                    value: inst.proposal().clone(),
                }));
            }
        }
        out
    }

    /// Dispatch an inbound message. Returns outbound messages: [`Prepare`]
    /// and [`Accept`] for the acceptors, [`Chosen`] for delivery.
    pub fn handle(&mut self, message: &Message, now: Instant) -> Vec<Message> {
        match message {
            Message::Promise(promise) => self.receive_promise(promise, now).into_iter().collect(),
            Message::Accepted(accepted) => self
                .receive_accepted(accepted)
                .map(Message::from)
                .into_iter()
                .collect(),
            Message::Preempted(preempted) => self
                .receive_preempted(preempted, now)
                .map(Message::from)
                .into_iter()
                .collect(),
            Message::Chosen(chosen) => {
                self.receive_chosen(chosen);
                Vec::new()
            }
            Message::Trim(trim) => {
                self.receive_trim(trim);
                Vec::new()
            }
            Message::AcceptorState(state) => {
                self.receive_acceptor_state(state);
                Vec::new()
            }
            other => {
                trace!(
                    proposer = self.id,
                    message = ?other,
                    "ignoring message not meant for proposers"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn proposer(id: ProposerId) -> Proposer {
        Proposer::new(id, ProposerConfig::default()).unwrap()
    }

    fn promise(aid: u32, iid: InstanceId, ballot: Ballot) -> Promise {
        Promise {
            aid,
            iid,
            ballot,
            value_ballot: Ballot::ZERO,
            value: Value::empty(),
        }
    }

    fn promise_with(aid: u32, iid: InstanceId, ballot: Ballot, vb: Ballot, v: &str) -> Promise {
        Promise {
            aid,
            iid,
            ballot,
            value_ballot: vb,
            value: Value::from(v),
        }
    }

    fn preempted(aid: u32, iid: InstanceId, ballot: Ballot) -> Preempted {
        Preempted { aid, iid, ballot }
    }

    fn chosen(iid: InstanceId, ballot: Ballot, v: &str) -> Chosen {
        Chosen {
            iid,
            ballot,
            value: Value::from(v),
        }
    }

    fn accepted(aid: u32, iid: InstanceId, ballot: Ballot, v: &str) -> Accepted {
        Accepted {
            aid,
            iid,
            ballot,
            value_ballot: ballot,
            value: Value::from(v),
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ProposerConfig {
            q1: 1,
            q2: 1,
            ..ProposerConfig::default()
        };
        assert!(Proposer::new(1, config).is_err());
    }

    #[test]
    fn propose_does_not_open_instances() {
        let mut p = proposer(1);
        p.propose(Value::from("x")).unwrap();
        assert_eq!(p.pending_count(), 1);
        assert_eq!(p.prepared_count(), 0);

        let now = Instant::now();
        let prepare = p.try_prepare(now).unwrap();
        assert_eq!((prepare.iid, prepare.ballot), (1, Ballot::initial(1)));
        assert_eq!(p.pending_count(), 0);
        assert_eq!(p.prepared_count(), 1);
        assert_eq!(p.try_prepare(now), None);
    }

    #[test]
    fn pending_capacity_hands_value_back() {
        let config = ProposerConfig {
            pending_capacity: 2,
            ..ProposerConfig::default()
        };
        let mut p = Proposer::new(1, config).unwrap();
        p.propose(Value::from("a")).unwrap();
        p.propose(Value::from("b")).unwrap();
        let err = p.propose(Value::from("c")).unwrap_err();
        assert_eq!(err.into_value(), Value::from("c"));
    }

    #[test]
    fn window_limits_in_flight() {
        let config = ProposerConfig {
            preexec_window: 2,
            ..ProposerConfig::default()
        };
        let mut p = Proposer::new(1, config).unwrap();
        for v in ["a", "b", "c"] {
            p.propose(Value::from(v)).unwrap();
        }
        let prepares = p.prepare_all(Instant::now());
        assert_eq!(prepares.iter().map(|p| p.iid).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(p.pending_count(), 1);
    }

    #[test]
    fn basic_commit() {
        let now = Instant::now();
        let mut p = proposer(1);
        p.propose(Value::from("X")).unwrap();
        let prepare = p.try_prepare(now).unwrap();

        assert_eq!(p.receive_promise(&promise(0, 1, prepare.ballot), now), None);
        // duplicate promise does not count twice
        assert_eq!(p.receive_promise(&promise(0, 1, prepare.ballot), now), None);
        let Some(Message::Accept(accept)) = p.receive_promise(&promise(1, 1, prepare.ballot), now)
        else {
            panic!("expected accept");
        };
        assert_eq!(accept.value, Value::from("X"));
        assert_eq!(p.prepared_count(), 0);
        assert_eq!(p.accepting_count(), 1);

        assert_eq!(p.receive_accepted(&accepted(2, 1, accept.ballot, "X")), None);
        let chosen = p.receive_accepted(&accepted(0, 1, accept.ballot, "X")).unwrap();
        assert_eq!(chosen.iid, 1);
        assert_eq!(chosen.value, Value::from("X"));
        assert_eq!(p.accepting_count(), 0);

        // late ack for a chosen instance is dropped
        assert_eq!(p.receive_accepted(&accepted(1, 1, accept.ballot, "X")), None);
    }

    #[test]
    fn adopts_highest_promised_value_and_requeues_own() {
        let now = Instant::now();
        let mut p = proposer(3);
        p.propose(Value::from("mine")).unwrap();
        let prepare = p.try_prepare(now).unwrap();
        let b = prepare.ballot;

        p.receive_promise(&promise_with(0, 1, b, Ballot::new(0, 1), "old"), now);
        let Some(Message::Accept(accept)) =
            p.receive_promise(&promise_with(1, 1, b, Ballot::new(0, 2), "newer"), now)
        else {
            panic!("expected accept");
        };
        assert_eq!(accept.value, Value::from("newer"));

        p.receive_accepted(&accepted(0, 1, b, "newer"));
        let chosen = p.receive_accepted(&accepted(1, 1, b, "newer")).unwrap();
        assert_eq!(chosen.value, Value::from("newer"));
        assert_eq!(p.pending_count(), 1);

        // our value goes into the next instance
        let prepare = p.try_prepare(now).unwrap();
        assert_eq!(prepare.iid, 2);
    }

    #[test]
    fn stale_promise_ignored() {
        let now = Instant::now();
        let mut p = proposer(1);
        p.propose(Value::from("x")).unwrap();
        p.try_prepare(now).unwrap();
        let retry = p
            .receive_preempted(&preempted(0, 1, Ballot::new(0, 2)), now)
            .unwrap();
        assert_eq!(retry.ballot, Ballot::new(1, 1));

        assert_eq!(p.receive_promise(&promise(0, 1, Ballot::initial(1)), now), None);
        assert_eq!(p.receive_promise(&promise(9, 5, Ballot::initial(1)), now), None);
    }

    #[test]
    fn higher_promise_is_preemption() {
        let now = Instant::now();
        let mut p = proposer(1);
        p.propose(Value::from("x")).unwrap();
        p.try_prepare(now).unwrap();
        let reply = p.receive_promise(&promise(0, 1, Ballot::new(4, 2)), now);
        let Some(Message::Prepare(retry)) = reply else {
            panic!("expected a retry prepare, got {reply:?}");
        };
        assert_eq!((retry.iid, retry.ballot), (1, Ballot::new(5, 1)));
        assert_eq!(p.prepared_count(), 1);
    }

    #[test]
    fn preempted_in_phase_two_restarts_phase_one() {
        let now = Instant::now();
        let mut p = proposer(1);
        p.propose(Value::from("x")).unwrap();
        let b = p.try_prepare(now).unwrap().ballot;
        p.receive_promise(&promise(0, 1, b), now);
        p.receive_promise(&promise(1, 1, b), now).unwrap();
        assert_eq!(p.accepting_count(), 1);

        // not higher than ours: ignored
        assert_eq!(p.receive_preempted(&preempted(2, 1, b), now), None);
        let retry = p
            .receive_preempted(&preempted(2, 1, Ballot::new(3, 0)), now)
            .unwrap();
        assert_eq!((retry.iid, retry.ballot), (1, Ballot::new(4, 1)));
        assert_eq!(p.accepting_count(), 0);
        assert_eq!(p.prepared_count(), 1);
        assert_eq!(p.preparing[&1].retries, 1);

        // votes from the old ballot do not count
        assert_eq!(p.receive_promise(&promise(0, 1, b), now), None);
        assert_eq!(p.receive_promise(&promise(0, 1, retry.ballot), now), None);
        assert!(p.receive_promise(&promise(1, 1, retry.ballot), now).is_some());
    }

    #[test]
    fn timeouts_retransmit_same_ballot() {
        let start = Instant::now();
        let mut p = proposer(1);
        p.propose(Value::from("a")).unwrap();
        p.propose(Value::from("b")).unwrap();
        let first = p.try_prepare(start).unwrap();
        p.receive_promise(&promise(0, 1, first.ballot), start);
        p.receive_promise(&promise(1, 1, first.ballot), start);
        let later = start + Duration::from_millis(500);
        let second = p.try_prepare(later).unwrap();

        assert!(p.timeouts(start + Duration::from_millis(999)).is_empty());
        let sent = p.timeouts(start + Duration::from_secs(1));
        assert_eq!(
            sent,
            vec![Message::Accept(Accept {
                iid: 1,
                ballot: first.ballot,
                value: Value::from("a")
            })]
        );
        let sent = p.timeouts(later + Duration::from_secs(1));
        assert_eq!(sent, vec![Message::Prepare(second)]);
        // clocks were reset
        assert!(p.timeouts(later + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn trim_drops_instances_and_skips_ids() {
        let now = Instant::now();
        let mut p = proposer(1);
        for v in ["a", "b", "c"] {
            p.propose(Value::from(v)).unwrap();
        }
        p.prepare_all(now);
        assert_eq!(p.prepared_count(), 3);

        assert!(p.receive_trim(&Trim { iid: 2 }));
        assert!(!p.receive_trim(&Trim { iid: 2 }));
        assert_eq!(p.prepared_count(), 1);
        assert_eq!(p.pending_count(), 0);
        assert_eq!(p.receive_promise(&promise(0, 1, Ballot::initial(1)), now), None);

        let state = AcceptorState {
            aid: 0,
            trim_iid: 10,
        };
        assert!(p.receive_acceptor_state(&state));
        assert_eq!(p.max_trim_iid(), 10);
        assert_eq!(p.next_instance(), 11);
        p.propose(Value::from("d")).unwrap();
        assert_eq!(p.try_prepare(now).unwrap().iid, 11);
    }

    #[test]
    fn chosen_elsewhere_is_skipped() {
        let now = Instant::now();
        let mut p = proposer(1);
        p.receive_chosen(&chosen(1, Ballot::initial(2), "z"));
        p.propose(Value::from("a")).unwrap();
        assert_eq!(p.try_prepare(now).unwrap().iid, 2);

        // an instance we were driving gets chosen with another value
        p.receive_chosen(&chosen(2, Ballot::new(1, 2), "z"));
        assert_eq!(p.prepared_count(), 0);
        assert_eq!(p.pending_count(), 1);
    }

    #[test]
    fn handle_dispatches() {
        let now = Instant::now();
        let mut p = proposer(1);
        p.propose(Value::from("a")).unwrap();
        let b = p.try_prepare(now).unwrap().ballot;
        assert!(p.handle(&Message::Promise(promise(0, 1, b)), now).is_empty());
        let out = p.handle(&Message::Promise(promise(1, 1, b)), now);
        assert!(matches!(out.as_slice(), [Message::Accept(_)]));
        p.handle(&Message::Accepted(accepted(0, 1, b, "a")), now);
        let out = p.handle(&Message::Accepted(accepted(1, 1, b, "a")), now);
        assert!(matches!(out.as_slice(), [Message::Chosen(_)]));
        assert!(p.handle(&Message::Prepare(Prepare { iid: 1, ballot: b }), now).is_empty());
    }
}
