//! Multi-instance Paxos consensus core
//!
//! Acceptors, proposers and learners as pure state machines that agree on an
//! ordered, durable sequence of values. The crate does no I/O of its own:
//! callers feed decoded [`Message`]s in, route the returned messages, drive
//! timeouts with their own clock, and pick a [`storage`] backend for each
//! acceptor.
//!
//! # Architecture
//!
//! - **Proposers** ([`Proposer`]): queue client values, open instances, and
//!   drive them through phase 1 and phase 2 with independent quorums `q1` and
//!   `q2`
//! - **Acceptors** ([`Acceptor`]): answer prepares and accepts, persisting
//!   every decision inside one storage transaction
//! - **Learners** ([`Learner`]): collect accepted acks and deliver chosen
//!   values in instance order
//!
//! # Quick Start
//!
//! ```
//! use std::time::Instant;
//!
//! use paxos_core::storage::MemoryStorage;
//! use paxos_core::{Acceptor, Message, Proposer, ProposerConfig, Value};
//!
//! let mut acceptors: Vec<_> = (0..3)
//!     .map(|aid| Acceptor::new(aid, MemoryStorage::new()).unwrap())
//!     .collect();
//! let mut proposer = Proposer::new(1, ProposerConfig::default()).unwrap();
//!
//! let now = Instant::now();
//! proposer.propose(Value::from("X")).unwrap();
//! let mut outbox: Vec<Message> = proposer
//!     .prepare_all(now)
//!     .into_iter()
//!     .map(Message::from)
//!     .collect();
//! let mut chosen = None;
//! while let Some(message) = outbox.pop() {
//!     if let Message::Chosen(c) = message {
//!         chosen = Some(c);
//!         continue;
//!     }
//!     for acceptor in &mut acceptors {
//!         for reply in acceptor.handle(&message).unwrap() {
//!             outbox.extend(proposer.handle(&reply, now));
//!         }
//!     }
//! }
//! let chosen = chosen.unwrap();
//! assert_eq!((chosen.iid, chosen.value), (1, Value::from("X")));
//! ```

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod carray;
pub mod config;
pub mod error;
pub mod learner;
pub mod messages;
pub mod proposer;
pub mod quorum;
pub mod storage;
pub mod types;

pub use acceptor::Acceptor;
pub use config::{LearnerConfig, ProposerConfig, StorageConfig};
pub use error::{AcceptorError, ConfigError, PendingFull, StorageError};
pub use learner::{Deliver, Learner};
pub use messages::{
    Accept, Accepted, AcceptorState, Chosen, Destination, Envelope, Message, Preempted, Prepare,
    Promise, Repeat, Trim,
};
pub use proposer::Proposer;
pub use quorum::Quorum;
pub use storage::{Backend, Storage};
pub use types::{AcceptedRecord, AcceptorId, Ballot, InstanceId, ProposerId, Value};
