//! Segment-keyed metadata store backed by one redb database per collection.

use std::path::{Path, PathBuf};

use nimbus_types::{SegmentKey, TenantId, Timestamp, ValueRecord};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::trace;

use crate::error::{StoreError, StoreResult};

/// Key: ordered [`SegmentKey`] encoding, Value: record codec bytes.
const SEGMENTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("segments");

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    /// Entries in key order.
    pub entries: Vec<(SegmentKey, ValueRecord)>,
    /// Pass back as the cursor to continue after the last entry. `None`
    /// when the listing is exhausted.
    pub next_cursor: Option<Vec<u8>>,
}

/// What [`SegmentStore::upsert`] did with an offered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record is now current. `previous_size` is the size of the record
    /// it replaced.
    Applied { previous_size: u64 },
    /// A record at least as new was already stored and is kept.
    Ignored { current: Timestamp },
}

impl InsertOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, InsertOutcome::Applied { .. })
    }

    /// Size of the superseded record; 0 when the offer was ignored.
    pub fn previous_size(&self) -> u64 {
        match self {
            InsertOutcome::Applied { previous_size } => *previous_size,
            InsertOutcome::Ignored { .. } => 0,
        }
    }
}

/// Ordered key/value store holding the current [`ValueRecord`] of every
/// segment slot of one tenant on one node.
///
/// Writers are serialized by the database's single write transaction, so
/// concurrent inserts on one handle never interleave their
/// read-compare-write.
pub struct SegmentStore {
    db: Database,
    tenant_id: TenantId,
    path: PathBuf,
}

impl SegmentStore {
    /// Opens or creates the store at `path`.
    pub fn open(path: impl AsRef<Path>, tenant_id: TenantId) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path)?;

        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(SEGMENTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            tenant_id,
            path,
        })
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores `record` at `key` unless the current record is at least as new.
    ///
    /// Returns the size of the superseded record: 0 if there was none, if it
    /// was a tombstone, or if `record` was ignored as stale.
    pub fn insert(&self, key: &SegmentKey, record: &ValueRecord) -> StoreResult<u64> {
        Ok(self.upsert(key, record)?.previous_size())
    }

    /// Like [`SegmentStore::insert`], but tells an ignored stale record
    /// apart from one that replaced nothing.
    pub fn upsert(&self, key: &SegmentKey, record: &ValueRecord) -> StoreResult<InsertOutcome> {
        self.check_tenant(key)?;
        let encoded_key = key.encode();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SEGMENTS_TABLE)?;

            let existing = match table.get(encoded_key.as_slice())? {
                Some(value) => Some(ValueRecord::from_slice(value.value())?),
                None => None,
            };

            match existing {
                Some(current) if current.timestamp() >= record.timestamp() => {
                    trace!(
                        key = %key,
                        stored = %current.timestamp(),
                        offered = %record.timestamp(),
                        "ignoring record not newer than stored one"
                    );
                    InsertOutcome::Ignored {
                        current: current.timestamp(),
                    }
                }
                current => {
                    table.insert(encoded_key.as_slice(), record.to_vec().as_slice())?;
                    InsertOutcome::Applied {
                        previous_size: current.map_or(0, |c| c.size()),
                    }
                }
            }
        };
        write_txn.commit()?;

        Ok(outcome)
    }

    /// Returns the current record, `None` if the key was never written.
    ///
    /// A deleted key yields [`ValueRecord::Tombstone`].
    pub fn lookup(&self, key: &SegmentKey) -> StoreResult<Option<ValueRecord>> {
        self.check_tenant(key)?;

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SEGMENTS_TABLE)?;

        let record = match table.get(key.encode().as_slice())? {
            Some(value) => Some(ValueRecord::from_slice(value.value())?),
            None => None,
        };
        Ok(record)
    }

    /// Writes a tombstone at `timestamp`, with the same supersession rules as
    /// [`SegmentStore::insert`].
    pub fn delete(&self, key: &SegmentKey, timestamp: Timestamp) -> StoreResult<u64> {
        self.insert(key, &ValueRecord::Tombstone { timestamp })
    }

    /// Lists slots whose object key starts with `prefix`, in key order.
    ///
    /// Resumes strictly after `cursor` when given. A `limit` of 0 means no
    /// limit. Tombstones are included.
    pub fn list(
        &self,
        prefix: &[u8],
        cursor: Option<&[u8]>,
        limit: usize,
    ) -> StoreResult<ListPage> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        let encoded_prefix = SegmentKey::encode_prefix(prefix);
        let start = match cursor {
            Some(cursor) if cursor > encoded_prefix.as_slice() => cursor.to_vec(),
            _ => encoded_prefix.clone(),
        };

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SEGMENTS_TABLE)?;

        let mut entries = Vec::new();
        let mut last_key = None;
        let mut more = false;

        for item in table.range::<&[u8]>(start.as_slice()..)? {
            let (raw_key, raw_value) = item?;
            let raw_key = raw_key.value();
            if Some(raw_key) == cursor {
                continue;
            }
            if !raw_key.starts_with(&encoded_prefix) {
                break;
            }
            if entries.len() == limit {
                more = true;
                break;
            }
            let key = SegmentKey::decode(self.tenant_id, raw_key)?;
            let record = ValueRecord::from_slice(raw_value.value())?;
            last_key = Some(raw_key.to_vec());
            entries.push((key, record));
        }

        Ok(ListPage {
            entries,
            next_cursor: if more { last_key } else { None },
        })
    }

    fn check_tenant(&self, key: &SegmentKey) -> StoreResult<()> {
        if key.tenant_id != self.tenant_id {
            return Err(StoreError::TenantMismatch {
                store_tenant: self.tenant_id,
                key_tenant: key.tenant_id,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("tenant_id", &self.tenant_id)
            .field("path", &self.path)
            .finish()
    }
}
