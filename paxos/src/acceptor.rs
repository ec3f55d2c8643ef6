//! Acceptor state machine.
//!
//! Pure request/response with no timers. Every mutating request runs one
//! storage transaction around its read-decide-write sequence. If the storage
//! fails, the transaction is aborted and the acceptor's cached state is left
//! as it was.

use error_stack::{Report, ResultExt};
use tracing::{debug, trace, warn};

use crate::error::{AcceptorError, StorageError};
use crate::messages::{Accept, Accepted, AcceptorState, Message, Preempted, Prepare, Promise, Trim};
use crate::storage::Storage;
use crate::types::{AcceptedRecord, AcceptorId, InstanceId};

/// A Paxos acceptor over storage `S`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Acceptor<S> {
    aid: AcceptorId,
    /// Cached copy of the storage watermark
    trim_iid: InstanceId,
    storage: S,
}

impl<S: Storage> Acceptor<S> {
    /// Create an acceptor, loading the trim watermark from `storage`.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] if the watermark cannot be read.
    pub fn new(aid: AcceptorId, storage: S) -> Result<Self, Report<AcceptorError>> {
        let mut acceptor = Self {
            aid,
            trim_iid: 0,
            storage,
        };
        let trim_iid = acceptor.transaction(|s| s.trim_instance())?;
        acceptor.trim_iid = trim_iid;
        debug!(aid, trim_iid, "acceptor started");
        Ok(acceptor)
    }

    #[must_use]
    pub fn aid(&self) -> AcceptorId {
        self.aid
    }

    #[must_use]
    pub fn trim_iid(&self) -> InstanceId {
        self.trim_iid
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Release the acceptor, returning its storage.
    #[must_use]
    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Run `f` inside a storage transaction, committing on success and
    /// aborting on failure.
    fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut S) -> Result<T, Report<StorageError>>,
    ) -> Result<T, Report<AcceptorError>> {
        self.storage.begin().change_context(AcceptorError)?;
        let out = match f(&mut self.storage) {
            Ok(out) => out,
            Err(e) => {
                self.storage.abort();
                warn!(aid = self.aid, error = ?e, "transaction aborted");
                return Err(e.change_context(AcceptorError));
            }
        };
        if let Err(e) = self.storage.commit() {
            warn!(aid = self.aid, error = ?e, "commit failed");
            return Err(e.change_context(AcceptorError));
        }
        Ok(out)
    }

    /// Phase 1: promise `prepare.ballot` unless a higher ballot is held.
    ///
    /// A stale prepare still gets a promise, built from the unmodified record,
    /// so the proposer sees the higher ballot. Returns `None` (no reply) for
    /// trimmed instances.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] if storage fails. Nothing was persisted.
    pub fn receive_prepare(
        &mut self,
        prepare: &Prepare,
    ) -> Result<Option<Promise>, Report<AcceptorError>> {
        let Prepare { iid, ballot } = *prepare;
        if iid <= self.trim_iid {
            trace!(
                aid = self.aid,
                iid,
                trim_iid = self.trim_iid,
                "dropping prepare for trimmed instance"
            );
            return Ok(None);
        }
        let aid = self.aid;
        let record = self
            .transaction(|s| match s.get(iid)? {
                Some(existing) if existing.ballot > ballot => {
                    trace!(aid, iid, %ballot, held = %existing.ballot, "stale prepare");
                    Ok(existing)
                }
                Some(mut existing) => {
                    existing.aid = aid;
                    existing.ballot = ballot;
                    s.put(existing.clone())?;
                    Ok(existing)
                }
                None => {
                    let record = AcceptedRecord::promised(aid, iid, ballot);
                    s.put(record.clone())?;
                    Ok(record)
                }
            })
            .attach(format!("prepare iid {iid} ballot {ballot}"))?;
        debug!(aid, iid, ballot = %record.ballot, value_ballot = %record.value_ballot, "promised");
        Ok(Some(Promise::from(record)))
    }

    /// Phase 2: accept `accept.value` unless a higher ballot is held.
    ///
    /// Replies [`Message::Accepted`] on success and [`Message::Preempted`]
    /// carrying the held ballot otherwise. Returns `None` for trimmed
    /// instances.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] if storage fails. Nothing was persisted.
    pub fn receive_accept(
        &mut self,
        accept: &Accept,
    ) -> Result<Option<Message>, Report<AcceptorError>> {
        let iid = accept.iid;
        let ballot = accept.ballot;
        if iid <= self.trim_iid {
            trace!(
                aid = self.aid,
                iid,
                trim_iid = self.trim_iid,
                "dropping accept for trimmed instance"
            );
            return Ok(None);
        }
        let aid = self.aid;
        let reply = self
            .transaction(|s| match s.get(iid)? {
                Some(existing) if existing.ballot > ballot => Ok(Message::Preempted(Preempted {
                    aid,
                    iid,
                    ballot: existing.ballot,
                })),
                _ => {
                    let record = AcceptedRecord::accepted(aid, iid, ballot, accept.value.clone());
                    s.put(record.clone())?;
                    Ok(Message::Accepted(Accepted::from(record)))
                }
            })
            .attach(format!("accept iid {iid} ballot {ballot}"))?;
        match &reply {
            Message::Preempted(p) => debug!(aid, iid, %ballot, held = %p.ballot, "preempted"),
            _ => debug!(aid, iid, %ballot, "accepted"),
        }
        Ok(Some(reply))
    }

    /// Retransmit the value accepted for `iid`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] if storage fails.
    pub fn receive_repeat(
        &self,
        iid: InstanceId,
    ) -> Result<Option<Accepted>, Report<AcceptorError>> {
        let record = self
            .storage
            .get(iid)
            .change_context(AcceptorError)
            .attach(format!("repeat iid {iid}"))?;
        Ok(record.filter(AcceptedRecord::has_value).map(Accepted::from))
    }

    /// Retransmit every accepted value in `from..=to`, skipping instances
    /// with nothing accepted.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] if storage fails.
    pub fn receive_repeat_range(
        &self,
        from: InstanceId,
        to: InstanceId,
    ) -> Result<Vec<Accepted>, Report<AcceptorError>> {
        let records = self
            .storage
            .range(from, to)
            .change_context(AcceptorError)
            .attach(format!("repeat {from}..={to}"))?;
        Ok(records
            .into_iter()
            .filter(AcceptedRecord::has_value)
            .map(Accepted::from)
            .collect())
    }

    /// Raise the watermark to `iid`. Returns whether it moved.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] if storage fails. The watermark is unchanged.
    pub fn receive_trim(&mut self, trim: &Trim) -> Result<bool, Report<AcceptorError>> {
        let iid = trim.iid;
        if iid <= self.trim_iid {
            trace!(aid = self.aid, iid, trim_iid = self.trim_iid, "ignoring stale trim");
            return Ok(false);
        }
        self.transaction(|s| s.trim(iid)).attach(format!("trim to {iid}"))?;
        self.trim_iid = iid;
        debug!(aid = self.aid, trim_iid = iid, "trimmed");
        Ok(true)
    }

    /// Status broadcast so proposers learn the watermark.
    #[must_use]
    pub fn current_state(&self) -> AcceptorState {
        AcceptorState {
            aid: self.aid,
            trim_iid: self.trim_iid,
        }
    }

    /// Dispatch an inbound message. Returns the replies for the sender.
    ///
    /// Messages not meant for acceptors are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`AcceptorError`] if storage fails.
    pub fn handle(&mut self, message: &Message) -> Result<Vec<Message>, Report<AcceptorError>> {
        let replies = match message {
            Message::Prepare(prepare) => self
                .receive_prepare(prepare)?
                .map(Message::from)
                .into_iter()
                .collect(),
            Message::Accept(accept) => self.receive_accept(accept)?.into_iter().collect(),
            Message::Repeat(repeat) => self
                .receive_repeat_range(repeat.from, repeat.to)?
                .into_iter()
                .map(Message::from)
                .collect(),
            Message::Trim(trim) => {
                self.receive_trim(trim)?;
                Vec::new()
            }
            other => {
                trace!(
                    aid = self.aid,
                    message = ?other,
                    "ignoring message not meant for acceptors"
                );
                Vec::new()
            }
        };
        Ok(replies)
    }
}
