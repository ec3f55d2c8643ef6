//! Volatile storage backend. State is lost when the value is dropped.

use std::collections::BTreeMap;

use error_stack::Report;
use tracing::trace;

use super::{Staged, Storage, no_transaction};
use crate::error::StorageError;
use crate::types::{AcceptedRecord, InstanceId};

/// In-memory [`Storage`] over an ordered map.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MemoryStorage {
    records: BTreeMap<InstanceId, AcceptedRecord>,
    trim_iid: InstanceId,
    staged: Option<Staged>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed records still retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn staged_mut(&mut self, op: &'static str) -> Result<&mut Staged, Report<StorageError>> {
        self.staged.as_mut().ok_or_else(|| no_transaction(op))
    }

    fn current_trim(&self) -> InstanceId {
        self.staged
            .as_ref()
            .map_or(self.trim_iid, |s| s.trim_or(self.trim_iid))
    }
}

impl Storage for MemoryStorage {
    fn begin(&mut self) -> Result<(), Report<StorageError>> {
        if self.staged.is_some() {
            return Err(Report::new(StorageError).attach("transaction already open"));
        }
        self.staged = Some(Staged::default());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Report<StorageError>> {
        let staged = self.staged.take().ok_or_else(|| no_transaction("commit"))?;
        self.records.extend(staged.writes);
        if let Some(trim) = staged.trim {
            self.records = match trim.checked_add(1) {
                Some(next) => self.records.split_off(&next),
                None => BTreeMap::new(),
            };
            self.trim_iid = trim;
            trace!(trim, retained = self.records.len(), "memory storage trimmed");
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.staged = None;
    }

    fn get(&self, iid: InstanceId) -> Result<Option<AcceptedRecord>, Report<StorageError>> {
        if iid <= self.current_trim() {
            return Ok(None);
        }
        let staged = self.staged.as_ref().and_then(|s| s.writes.get(&iid));
        Ok(staged.or_else(|| self.records.get(&iid)).cloned())
    }

    fn put(&mut self, record: AcceptedRecord) -> Result<(), Report<StorageError>> {
        self.staged_mut("put")?.put(record);
        Ok(())
    }

    fn trim(&mut self, iid: InstanceId) -> Result<(), Report<StorageError>> {
        let committed = self.trim_iid;
        self.staged_mut("trim")?.trim(committed, iid);
        Ok(())
    }

    fn trim_instance(&self) -> Result<InstanceId, Report<StorageError>> {
        Ok(self.current_trim())
    }

    fn max_instance(&self) -> Result<Option<InstanceId>, Report<StorageError>> {
        let trim = self.current_trim();
        let committed = self.records.keys().next_back().copied();
        let staged = self
            .staged
            .as_ref()
            .and_then(|s| s.writes.keys().next_back().copied());
        Ok(committed.max(staged).filter(|&iid| iid > trim))
    }

    fn range(
        &self,
        from: InstanceId,
        to: InstanceId,
    ) -> Result<Vec<AcceptedRecord>, Report<StorageError>> {
        let from = from.max(self.current_trim().saturating_add(1));
        if from > to {
            return Ok(Vec::new());
        }
        let mut merged: BTreeMap<InstanceId, &AcceptedRecord> =
            self.records.range(from..=to).map(|(k, v)| (*k, v)).collect();
        if let Some(staged) = &self.staged {
            merged.extend(staged.writes.range(from..=to).map(|(k, v)| (*k, v)));
        }
        Ok(merged.into_values().cloned().collect())
    }
}
