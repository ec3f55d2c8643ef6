//! Persistent storage backend using fjall.
//!
//! Layout:
//! - `records` keyspace: big-endian iid -> versioned postcard [`AcceptedRecord`]
//! - `meta` keyspace: `trim_iid` -> big-endian watermark
//!
//! A commit is a single fjall write batch: the watermark, the staged records
//! and the removal of trimmed records land together or not at all. Reads hide
//! everything at or below the watermark, and [`PersistentStorage::open`]
//! purges any records it finds there.
//!
//! The batch is synced with [`PersistMode::SyncAll`] before it is applied. If
//! the sync fails the commit reports an error and the batch stays invisible,
//! but it may already sit in the journal and be replayed on the next open.
//! fjall then refuses further writes to the database.

use std::fmt;
use std::path::Path;

use error_stack::{Report, ResultExt};
use fjall::{Database, Keyspace, KeyspaceCreateOptions, OwnedWriteBatch, PersistMode};
use tracing::{debug, trace, warn};

use super::{Staged, Storage, no_transaction};
use crate::error::StorageError;
use crate::types::{AcceptedRecord, InstanceId};

const STORAGE_MAGIC: [u8; 2] = [0xFF, 0xFE];
const STORAGE_VERSION: u8 = 1;
const TRIM_KEY: &[u8] = b"trim_iid";

fn storage_versioned_encode(version: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.extend_from_slice(&STORAGE_MAGIC);
    out.push(version);
    out.extend_from_slice(payload);
    out
}

fn storage_versioned_decode(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if bytes.len() >= 3 && bytes[..2] == STORAGE_MAGIC {
        Some((bytes[2], &bytes[3..]))
    } else {
        None
    }
}

fn keyspace_opts() -> KeyspaceCreateOptions {
    KeyspaceCreateOptions::default()
        .data_block_compression_policy(fjall::config::CompressionPolicy::disabled())
}

fn encode_record(record: &AcceptedRecord) -> Result<Vec<u8>, Report<StorageError>> {
    let data = postcard::to_allocvec(record)
        .change_context(StorageError)
        .attach(format!("failed to encode record for iid {}", record.iid))?;
    Ok(storage_versioned_encode(STORAGE_VERSION, &data))
}

fn decode_record(bytes: &[u8]) -> Result<AcceptedRecord, Report<StorageError>> {
    let Some((version, payload)) = storage_versioned_decode(bytes) else {
        return Err(Report::new(StorageError).attach("record is missing the storage header"));
    };
    if version != STORAGE_VERSION {
        return Err(Report::new(StorageError)
            .attach(format!("unsupported record version {version}")));
    }
    postcard::from_bytes(payload)
        .change_context(StorageError)
        .attach("failed to decode record")
}

fn parse_iid(key: &[u8]) -> Result<InstanceId, Report<StorageError>> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Report::new(StorageError).attach(format!("bad key length {}", key.len())))?;
    Ok(InstanceId::from_be_bytes(bytes))
}

fn read_trim(meta: &Keyspace) -> Result<InstanceId, Report<StorageError>> {
    let stored = meta
        .get(TRIM_KEY)
        .change_context(StorageError)
        .attach("failed to read trim watermark")?;
    stored.map_or(Ok(0), |bytes| {
        parse_iid(&bytes).attach("corrupt trim watermark")
    })
}

/// fjall-backed [`Storage`]. Reopening the same path resumes records and
/// watermark.
pub struct PersistentStorage {
    db: Database,
    records: Keyspace,
    meta: Keyspace,
    trim_iid: InstanceId,
    staged: Option<Staged>,
}

impl fmt::Debug for PersistentStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStorage")
            .field("trim_iid", &self.trim_iid)
            .field("in_transaction", &self.staged.is_some())
            .finish_non_exhaustive()
    }
}

impl PersistentStorage {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the database cannot be opened or holds
    /// an unreadable watermark.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Report<StorageError>> {
        let path = path.as_ref();
        let db = Database::builder(path)
            .open()
            .change_context(StorageError)
            .attach(format!("failed to open database at {}", path.display()))?;
        let records = db
            .keyspace("records", keyspace_opts)
            .change_context(StorageError)?;
        let meta = db
            .keyspace("meta", keyspace_opts)
            .change_context(StorageError)?;
        let trim_iid = read_trim(&meta)?;

        let storage = Self {
            db,
            records,
            meta,
            trim_iid,
            staged: None,
        };
        let mut batch = storage.db.batch().durability(Some(PersistMode::SyncAll));
        let purged = storage.remove_through(&mut batch, trim_iid)?;
        batch
            .commit()
            .change_context(StorageError)
            .attach("failed to purge trimmed records")?;
        debug!(trim_iid, purged, "persistent storage opened");
        Ok(storage)
    }

    fn persist(&self) -> Result<(), Report<StorageError>> {
        self.db
            .persist(PersistMode::SyncAll)
            .change_context(StorageError)
            .attach("failed to sync database")
    }

    fn current_trim(&self) -> InstanceId {
        self.staged
            .as_ref()
            .map_or(self.trim_iid, |s| s.trim_or(self.trim_iid))
    }

    fn staged_mut(&mut self, op: &'static str) -> Result<&mut Staged, Report<StorageError>> {
        self.staged.as_mut().ok_or_else(|| no_transaction(op))
    }

    /// Queue removal of every committed record with id `<= iid`.
    fn remove_through(
        &self,
        batch: &mut OwnedWriteBatch,
        iid: InstanceId,
    ) -> Result<usize, Report<StorageError>> {
        if iid == 0 {
            return Ok(0);
        }
        let mut removed = 0;
        for guard in self.records.range(..=iid.to_be_bytes()) {
            let (key, _) = guard.into_inner().change_context(StorageError)?;
            batch.remove(&self.records, key);
            removed += 1;
        }
        Ok(removed)
    }

    /// Build the batch for `staged`. Nothing is written until it commits.
    fn batch(&self, staged: &Staged) -> Result<OwnedWriteBatch, Report<StorageError>> {
        let mut batch = self.db.batch().durability(Some(PersistMode::SyncAll));
        let trim = staged.trim_or(self.trim_iid);
        for record in staged.writes.values().filter(|r| r.iid > trim) {
            batch.insert(&self.records, record.iid.to_be_bytes(), encode_record(record)?);
        }
        if let Some(trim) = staged.trim {
            batch.insert(&self.meta, TRIM_KEY, trim.to_be_bytes());
            let removed = self.remove_through(&mut batch, trim)?;
            trace!(trim, removed, "persistent storage trimming");
        }
        Ok(batch)
    }
}

impl Storage for PersistentStorage {
    fn begin(&mut self) -> Result<(), Report<StorageError>> {
        if self.staged.is_some() {
            return Err(Report::new(StorageError).attach("transaction already open"));
        }
        self.staged = Some(Staged::default());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Report<StorageError>> {
        let staged = self.staged.take().ok_or_else(|| no_transaction("commit"))?;
        let committed = self.batch(&staged).and_then(|batch| {
            batch
                .commit()
                .change_context(StorageError)
                .attach("failed to commit write batch")
        });
        if let Err(e) = committed {
            warn!(error = ?e, "commit failed");
            return Err(e);
        }
        if let Some(trim) = staged.trim {
            self.trim_iid = trim;
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
        if let Some(record) = self.staged.as_ref().and_then(|s| s.writes.get(&iid)) {
            return Ok(Some(record.clone()));
        }
        let stored = self
            .records
            .get(iid.to_be_bytes())
            .change_context(StorageError)
            .attach(format!("failed to read iid {iid}"))?;
        stored.map(|bytes| decode_record(&bytes)).transpose()
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
        let committed = match self.records.iter().rev().next() {
            Some(guard) => {
                let (key, _) = guard.into_inner().change_context(StorageError)?;
                Some(parse_iid(&key)?)
            }
            None => None,
        };
        let staged = self
            .staged
            .as_ref()
            .and_then(|s| s.writes.keys().next_back().copied());
        let trim = self.current_trim();
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
        let mut merged = std::collections::BTreeMap::new();
        for guard in self.records.range(from.to_be_bytes()..=to.to_be_bytes()) {
            let (_, value) = guard.into_inner().change_context(StorageError)?;
            let record = decode_record(&value)?;
            merged.insert(record.iid, record);
        }
        if let Some(staged) = &self.staged {
            merged.extend(staged.writes.range(from..=to).map(|(k, v)| (*k, v.clone())));
        }
        Ok(merged.into_values().collect())
    }

    fn close(&mut self) -> Result<(), Report<StorageError>> {
        self.staged = None;
        self.persist()
    }
}

impl Drop for PersistentStorage {
    fn drop(&mut self) {
        if let Err(e) = self.db.persist(PersistMode::SyncAll) {
            warn!(error = %e, "failed to sync database on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ballot, Value};

    #[test]
    fn versioned_encoding_round_trips() {
        let record = AcceptedRecord::accepted(3, 42, Ballot::new(2, 1), Value::from("hello"));
        let bytes = encode_record(&record).unwrap();
        assert_eq!(&bytes[..2], &STORAGE_MAGIC);
        assert_eq!(bytes[2], STORAGE_VERSION);
        assert_eq!(decode_record(&bytes).unwrap(), record);
    }

    #[test]
    fn commit_is_one_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut storage = PersistentStorage::open(dir.path()).unwrap();
        let b = Ballot::initial(1);
        storage.begin().unwrap();
        for iid in 1..=4 {
            storage
                .put(AcceptedRecord::accepted(0, iid, b, Value::from("old")))
                .unwrap();
        }
        storage.commit().unwrap();

        storage.begin().unwrap();
        storage
            .put(AcceptedRecord::accepted(0, 5, b, Value::from("new")))
            .unwrap();
        storage.trim(2).unwrap();
        storage
            .put(AcceptedRecord::accepted(0, 1, b, Value::from("below")))
            .unwrap();
        let staged = storage.staged.take().unwrap();

        // record 5, the watermark and two removals; record 1 is below the trim
        let batch = storage.batch(&staged).unwrap();
        assert_eq!(batch.len(), 4);
        drop(batch);

        // an uncommitted batch leaves nothing behind
        assert_eq!(read_trim(&storage.meta).unwrap(), 0);
        assert_eq!(storage.trim_instance().unwrap(), 0);
        assert_eq!(storage.get(5).unwrap(), None);
        assert_eq!(storage.range(1, 10).unwrap().len(), 4);

        storage.batch(&staged).unwrap().commit().unwrap();
        assert_eq!(read_trim(&storage.meta).unwrap(), 2);
        assert!(storage.records.get(1u64.to_be_bytes()).unwrap().is_none());
        assert!(storage.records.get(2u64.to_be_bytes()).unwrap().is_none());
        assert!(storage.records.get(3u64.to_be_bytes()).unwrap().is_some());
        assert!(storage.records.get(5u64.to_be_bytes()).unwrap().is_some());
    }

    #[test]
    fn rejects_unknown_header() {
        assert!(decode_record(&[1, 2, 3, 4]).is_err());
        let bytes = storage_versioned_encode(9, &[0]);
        assert!(decode_record(&bytes).is_err());
        assert!(parse_iid(&[0; 4]).is_err());
        assert_eq!(parse_iid(&7u64.to_be_bytes()).unwrap(), 7);
    }
}
