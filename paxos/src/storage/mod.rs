//! Durable acceptor state.
//!
//! A [`Storage`] holds one [`AcceptedRecord`] per retained instance and the
//! trim watermark. Writes are staged in a transaction and become visible to
//! later transactions only on [`commit`](Storage::commit).
//!
//! Ballot ordering is not checked here. The acceptor decides, storage obeys.

use std::collections::BTreeMap;

use error_stack::Report;
#[cfg(feature = "persistent")]
use error_stack::ResultExt;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{ConfigError, StorageError};
use crate::types::{AcceptedRecord, AcceptorId, InstanceId};

mod memory;
#[cfg(feature = "persistent")]
mod persistent;

pub use memory::MemoryStorage;
#[cfg(feature = "persistent")]
pub use persistent::PersistentStorage;

/// Transactional record store for one acceptor.
///
/// Reads see the writes staged by the open transaction. A read of a trimmed
/// instance returns `None`, never a zeroed record.
pub trait Storage {
    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Fails if a transaction is already open.
    fn begin(&mut self) -> Result<(), Report<StorageError>>;

    /// Make every staged write durable.
    ///
    /// # Errors
    ///
    /// Fails if no transaction is open or the backend cannot persist. The
    /// transaction is closed either way.
    fn commit(&mut self) -> Result<(), Report<StorageError>>;

    /// Discard every staged write. A no-op when no transaction is open.
    fn abort(&mut self);

    /// Record for `iid`, or `None` if absent or trimmed.
    ///
    /// # Errors
    ///
    /// Fails on backend read or decode errors.
    fn get(&self, iid: InstanceId) -> Result<Option<AcceptedRecord>, Report<StorageError>>;

    /// Stage `record`, replacing any record for the same instance.
    ///
    /// # Errors
    ///
    /// Fails if no transaction is open.
    fn put(&mut self, record: AcceptedRecord) -> Result<(), Report<StorageError>>;

    /// Stage deletion of every record with id `<= iid` and raise the
    /// watermark. A no-op if `iid` is not above the current watermark.
    ///
    /// # Errors
    ///
    /// Fails if no transaction is open.
    fn trim(&mut self, iid: InstanceId) -> Result<(), Report<StorageError>>;

    /// Current trim watermark (0 when nothing was ever trimmed).
    ///
    /// # Errors
    ///
    /// Fails on backend read errors.
    fn trim_instance(&self) -> Result<InstanceId, Report<StorageError>>;

    /// Highest retained instance id.
    ///
    /// # Errors
    ///
    /// Fails on backend read errors.
    fn max_instance(&self) -> Result<Option<InstanceId>, Report<StorageError>>;

    /// Every retained record in `from..=to`, in instance order.
    ///
    /// # Errors
    ///
    /// Fails on backend read or decode errors.
    fn range(
        &self,
        from: InstanceId,
        to: InstanceId,
    ) -> Result<Vec<AcceptedRecord>, Report<StorageError>>;

    /// Every retained record, in instance order.
    ///
    /// # Errors
    ///
    /// Fails on backend read or decode errors.
    fn untrimmed(&self) -> Result<Vec<AcceptedRecord>, Report<StorageError>> {
        let from = self.trim_instance()?.saturating_add(1);
        self.range(from, InstanceId::MAX)
    }

    /// Flush and release the backend.
    ///
    /// # Errors
    ///
    /// Fails if the final flush fails.
    fn close(&mut self) -> Result<(), Report<StorageError>> {
        Ok(())
    }
}

/// Writes staged by an open transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub(crate) struct Staged {
    pub(crate) writes: BTreeMap<InstanceId, AcceptedRecord>,
    pub(crate) trim: Option<InstanceId>,
}

impl Staged {
    pub(crate) fn put(&mut self, record: AcceptedRecord) {
        self.writes.insert(record.iid, record);
    }

    /// Stage a trim over `committed_trim`. Returns `false` when it is a no-op.
    pub(crate) fn trim(&mut self, committed_trim: InstanceId, iid: InstanceId) -> bool {
        if iid <= self.trim.unwrap_or(committed_trim) {
            return false;
        }
        self.trim = Some(iid);
        match iid.checked_add(1) {
            Some(next) => self.writes = self.writes.split_off(&next),
            None => self.writes.clear(),
        }
        true
    }

    pub(crate) fn trim_or(&self, committed_trim: InstanceId) -> InstanceId {
        self.trim.unwrap_or(committed_trim)
    }
}

pub(crate) fn no_transaction(op: &'static str) -> Report<StorageError> {
    Report::new(StorageError).attach(format!("{op} called without an open transaction"))
}

/// Storage selected once from [`StorageConfig`].
#[derive(Debug)]
pub enum Backend {
    Memory(MemoryStorage),
    #[cfg(feature = "persistent")]
    Persistent(PersistentStorage),
}

impl Backend {
    /// Open the backend described by `config` for acceptor `aid`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the backend cannot be opened or was not
    /// compiled in.
    pub fn open(aid: AcceptorId, config: &StorageConfig) -> Result<Self, Report<ConfigError>> {
        match config {
            StorageConfig::Memory => {
                debug!(aid, "opening in-memory storage");
                Ok(Self::Memory(MemoryStorage::new()))
            }
            #[cfg(feature = "persistent")]
            StorageConfig::Persistent { path } => {
                debug!(aid, path = %path.display(), "opening persistent storage");
                let storage = PersistentStorage::open(path)
                    .change_context(ConfigError)
                    .attach(format!("acceptor {aid}"))?;
                Ok(Self::Persistent(storage))
            }
            #[cfg(not(feature = "persistent"))]
            StorageConfig::Persistent { path } => Err(Report::new(ConfigError).attach(format!(
                "persistent storage at {} requires the `persistent` feature",
                path.display()
            ))),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $body:expr) => {
        match $self {
            Backend::Memory($s) => $body,
            #[cfg(feature = "persistent")]
            Backend::Persistent($s) => $body,
        }
    };
}

impl Storage for Backend {
    fn begin(&mut self) -> Result<(), Report<StorageError>> {
        dispatch!(self, s => s.begin())
    }

    fn commit(&mut self) -> Result<(), Report<StorageError>> {
        dispatch!(self, s => s.commit())
    }

    fn abort(&mut self) {
        dispatch!(self, s => s.abort());
    }

    fn get(&self, iid: InstanceId) -> Result<Option<AcceptedRecord>, Report<StorageError>> {
        dispatch!(self, s => s.get(iid))
    }

    fn put(&mut self, record: AcceptedRecord) -> Result<(), Report<StorageError>> {
        dispatch!(self, s => s.put(record))
    }

    fn trim(&mut self, iid: InstanceId) -> Result<(), Report<StorageError>> {
        dispatch!(self, s => s.trim(iid))
    }

    fn trim_instance(&self) -> Result<InstanceId, Report<StorageError>> {
        dispatch!(self, s => s.trim_instance())
    }

    fn max_instance(&self) -> Result<Option<InstanceId>, Report<StorageError>> {
        dispatch!(self, s => s.max_instance())
    }

    fn range(
        &self,
        from: InstanceId,
        to: InstanceId,
    ) -> Result<Vec<AcceptedRecord>, Report<StorageError>> {
        dispatch!(self, s => s.range(from, to))
    }

    fn close(&mut self) -> Result<(), Report<StorageError>> {
        dispatch!(self, s => s.close())
    }
}
