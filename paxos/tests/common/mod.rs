//! Shared test harness: tracing setup and an in-process cluster that routes
//! envelopes between real acceptors, proposers and a learner.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use paxos_core::storage::MemoryStorage;
use paxos_core::{
    Acceptor, Chosen, Destination, Envelope, InstanceId, Learner, LearnerConfig, Message,
    Proposer, ProposerConfig, ProposerId, Value,
};
use rand::Rng;

/// Initialize tracing for tests. Call at the start of each test.
/// Uses `RUST_LOG` for filtering (defaults to "debug" for this crate).
pub fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("paxos_core=debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    // thread-local default, so parallel tests don't fight over a global one
    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

/// A message in flight, remembering which proposer the exchange belongs to.
#[derive(Clone, Debug)]
pub struct InFlight {
    pub origin: ProposerId,
    pub envelope: Envelope,
}

pub struct Cluster {
    pub acceptors: Vec<Acceptor<MemoryStorage>>,
    pub proposers: BTreeMap<ProposerId, Proposer>,
    pub learner: Learner,
    pub network: VecDeque<InFlight>,
    /// Every value any proposer reported chosen
    pub chosen: BTreeMap<InstanceId, Value>,
    /// Values the learner delivered, in order
    pub delivered: Vec<(InstanceId, Value)>,
    pub now: Instant,
}

impl Cluster {
    pub fn new(acceptors: u32, proposers: &[ProposerId], config: &ProposerConfig) -> Self {
        let acceptors = (0..acceptors)
            .map(|aid| Acceptor::new(aid, MemoryStorage::new()).unwrap())
            .collect();
        let proposers = proposers
            .iter()
            .map(|&id| (id, Proposer::new(id, config.clone()).unwrap()))
            .collect();
        let learner = Learner::new(LearnerConfig {
            acceptors: config.acceptors,
            quorum: config.q2,
            instances: 4096,
            catch_up: true,
        })
        .unwrap();
        Self {
            acceptors,
            proposers,
            learner,
            network: VecDeque::new(),
            chosen: BTreeMap::new(),
            delivered: Vec::new(),
            now: Instant::now(),
        }
    }

    pub fn proposer(&mut self, id: ProposerId) -> &mut Proposer {
        self.proposers.get_mut(&id).unwrap()
    }

    pub fn propose(&mut self, id: ProposerId, value: impl Into<Value>) {
        self.proposer(id).propose(value.into()).unwrap();
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    fn record_chosen(&mut self, chosen: &Chosen) {
        match self.chosen.get(&chosen.iid) {
            Some(existing) => assert_eq!(
                existing, &chosen.value,
                "two different values chosen for instance {}",
                chosen.iid
            ),
            None => {
                self.chosen.insert(chosen.iid, chosen.value.clone());
            }
        }
    }

    /// Queue proposer output; chosen notifications are recorded directly.
    pub fn send_from(&mut self, origin: ProposerId, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            match message {
                Message::Chosen(chosen) => self.record_chosen(&chosen),
                message => self.network.push_back(InFlight {
                    origin,
                    envelope: Envelope::acceptors(message),
                }),
            }
        }
    }

    /// Let every proposer open as many instances as it can.
    pub fn open_instances(&mut self) {
        let now = self.now;
        let ids: Vec<_> = self.proposers.keys().copied().collect();
        for id in ids {
            let prepares = self.proposer(id).prepare_all(now);
            self.send_from(id, prepares.into_iter().map(Message::from));
        }
    }

    /// Fire every proposer's timeout sweep.
    pub fn fire_timeouts(&mut self) {
        let now = self.now;
        let ids: Vec<_> = self.proposers.keys().copied().collect();
        for id in ids {
            let resend = self.proposer(id).timeouts(now);
            self.send_from(id, resend);
        }
    }

    pub fn deliver(&mut self, in_flight: InFlight) {
        let InFlight { origin, envelope } = in_flight;
        match envelope.to {
            Destination::Proposer(id) => {
                let now = self.now;
                let out = self.proposer(id).handle(&envelope.message, now);
                self.send_from(id, out);
            }
            Destination::Acceptors | Destination::Acceptor(_) => {
                let mut replies = Vec::new();
                for acceptor in &mut self.acceptors {
                    if envelope.is_for_acceptor(acceptor.aid()) {
                        replies.extend(acceptor.handle(&envelope.message).unwrap());
                    }
                }
                for reply in replies {
                    if let Message::Accepted(accepted) = &reply {
                        self.learner.receive_accepted(accepted);
                    }
                    self.network.push_back(InFlight {
                        origin,
                        envelope: Envelope::proposer(origin, reply),
                    });
                }
            }
        }
        self.drain_learner();
    }

    fn drain_learner(&mut self) {
        let delivered = &mut self.delivered;
        self.learner
            .deliver(&mut |iid: InstanceId, value: Value| delivered.push((iid, value)));
    }

    /// Deliver everything in FIFO order until the network is empty, opening
    /// new instances whenever it drains.
    pub fn run(&mut self) {
        loop {
            while let Some(next) = self.network.pop_front() {
                self.deliver(next);
            }
            self.open_instances();
            if self.network.is_empty() {
                break;
            }
        }
    }

    /// One random scheduling step: deliver, drop or duplicate a random
    /// message, or let time pass and fire timeouts.
    pub fn step_random(&mut self, rng: &mut impl Rng, drop_rate: f64) {
        if self.network.is_empty() || rng.random_bool(0.02) {
            self.advance(Duration::from_millis(rng.random_range(100..1500)));
            self.fire_timeouts();
            self.open_instances();
            return;
        }
        let idx = rng.random_range(0..self.network.len());
        let Some(next) = self.network.remove(idx) else {
            return;
        };
        if rng.random_bool(drop_rate) {
            return;
        }
        if rng.random_bool(0.05) {
            self.network.push_back(next.clone());
        }
        self.deliver(next);
    }

    /// Learner output must agree with what proposers saw chosen.
    pub fn assert_consistent(&self) {
        for (iid, value) in &self.delivered {
            if let Some(chosen) = self.chosen.get(iid) {
                assert_eq!(chosen, value, "learner disagrees on instance {iid}");
            }
        }
        for pair in self.delivered.windows(2) {
            assert_eq!(pair[0].0 + 1, pair[1].0, "delivery out of order");
        }
    }
}
