//! Protocol messages exchanged between proposers, acceptors and learners.
//!
//! Encoding and delivery belong to the transport. The core only produces and
//! consumes these typed values, together with the [`Destination`] they are
//! addressed to.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::{AcceptedRecord, AcceptorId, Ballot, InstanceId, ProposerId, Value};

/// Phase 1a: ask acceptors to promise `ballot` for `iid`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Prepare {
    pub iid: InstanceId,
    pub ballot: Ballot,
}

/// Phase 1b: an acceptor's promise, disclosing whatever it accepted before.
///
/// `ballot` is the acceptor's current ballot for the instance. It is higher
/// than the requested ballot when the prepare was stale.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Promise {
    pub aid: AcceptorId,
    pub iid: InstanceId,
    pub ballot: Ballot,
    pub value_ballot: Ballot,
    pub value: Value,
}

/// Phase 2a: ask acceptors to accept `value` at `ballot`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Accept {
    pub iid: InstanceId,
    pub ballot: Ballot,
    pub value: Value,
}

/// Phase 2b: an acceptor accepted a value. Also the answer to a repeat request.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Accepted {
    pub aid: AcceptorId,
    pub iid: InstanceId,
    pub ballot: Ballot,
    pub value_ballot: Ballot,
    pub value: Value,
}

/// An accept was refused because the acceptor already holds `ballot`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Preempted {
    pub aid: AcceptorId,
    pub iid: InstanceId,
    pub ballot: Ballot,
}

/// Request retransmission of accepted values for `from..=to`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Repeat {
    pub from: InstanceId,
    pub to: InstanceId,
}

/// Raise the trim watermark to `iid`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Trim {
    pub iid: InstanceId,
}

/// Periodic acceptor status, lets proposers learn the watermark.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AcceptorState {
    pub aid: AcceptorId,
    pub trim_iid: InstanceId,
}

/// Notification that `value` was chosen for `iid`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Chosen {
    pub iid: InstanceId,
    pub ballot: Ballot,
    pub value: Value,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Message {
    Prepare(Prepare),
    Promise(Promise),
    Accept(Accept),
    Accepted(Accepted),
    Preempted(Preempted),
    Repeat(Repeat),
    Trim(Trim),
    AcceptorState(AcceptorState),
    Chosen(Chosen),
}

impl Message {
    /// Instance the message refers to, if it refers to exactly one.
    #[must_use]
    pub fn iid(&self) -> Option<InstanceId> {
        match self {
            Message::Prepare(m) => Some(m.iid),
            Message::Promise(m) => Some(m.iid),
            Message::Accept(m) => Some(m.iid),
            Message::Accepted(m) => Some(m.iid),
            Message::Preempted(m) => Some(m.iid),
            Message::Trim(m) => Some(m.iid),
            Message::Chosen(m) => Some(m.iid),
            Message::Repeat(_) | Message::AcceptorState(_) => None,
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

impl_from_message!(
    Prepare,
    Promise,
    Accept,
    Accepted,
    Preempted,
    Repeat,
    Trim,
    AcceptorState,
    Chosen,
);

impl From<AcceptedRecord> for Promise {
    fn from(r: AcceptedRecord) -> Self {
        Self {
            aid: r.aid,
            iid: r.iid,
            ballot: r.ballot,
            value_ballot: r.value_ballot,
            value: r.value,
        }
    }
}

impl From<AcceptedRecord> for Accepted {
    fn from(r: AcceptedRecord) -> Self {
        Self {
            aid: r.aid,
            iid: r.iid,
            ballot: r.ballot,
            value_ballot: r.value_ballot,
            value: r.value,
        }
    }
}

/// Where an outbound message should be delivered.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Destination {
    /// Every acceptor
    Acceptors,
    Acceptor(AcceptorId),
    Proposer(ProposerId),
}

/// An addressed message handed to the transport.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Envelope {
    pub to: Destination,
    pub message: Message,
}

impl Envelope {
    #[must_use]
    pub fn new(to: Destination, message: impl Into<Message>) -> Self {
        Self {
            to,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn acceptors(message: impl Into<Message>) -> Self {
        Self::new(Destination::Acceptors, message)
    }

    #[must_use]
    pub fn acceptor(aid: AcceptorId, message: impl Into<Message>) -> Self {
        Self::new(Destination::Acceptor(aid), message)
    }

    #[must_use]
    pub fn proposer(id: ProposerId, message: impl Into<Message>) -> Self {
        Self::new(Destination::Proposer(id), message)
    }

    /// Whether acceptor `aid` should receive this message.
    #[must_use]
    pub fn is_for_acceptor(&self, aid: AcceptorId) -> bool {
        match self.to {
            Destination::Acceptors => true,
            Destination::Acceptor(to) => to == aid,
            Destination::Proposer(_) => false,
        }
    }
}
