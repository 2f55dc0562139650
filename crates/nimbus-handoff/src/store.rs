//! Durable storage for segments held on behalf of other nodes.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use nimbus_types::{NodeName, Timestamp};
use nimbus_wire::SegmentDescriptor;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::HandoffResult;

/// Key: [`HandoffId`] bytes, Value: bincode [`HandoffRecord`].
const HANDOFFS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("handoffs");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffState {
    /// Waiting for delivery to the original destination.
    Pending,
    /// A delivery attempt is in progress.
    Forwarded,
    /// The original destination confirmed the write.
    Acknowledged,
}

/// A segment held for an unreachable node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub original_destination: NodeName,
    pub segment: SegmentDescriptor,
    pub data: Bytes,
    pub state: HandoffState,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    pub received_at: Timestamp,
}

impl HandoffRecord {
    pub fn new(original_destination: NodeName, segment: SegmentDescriptor, data: Bytes) -> Self {
        Self {
            original_destination,
            segment,
            data,
            state: HandoffState::Pending,
            attempts: 0,
            received_at: Timestamp::now(),
        }
    }

    pub fn id(&self) -> HandoffId {
        HandoffId::new(
            &self.original_destination,
            &self.segment.segment_key().encode(),
            self.segment.timestamp,
        )
    }
}

/// Identity of a held segment: destination, segment slot and write
/// timestamp. Records for one destination sort together.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandoffId(Vec<u8>);

impl HandoffId {
    fn new(destination: &NodeName, encoded_key: &[u8], timestamp: Timestamp) -> Self {
        let name = destination.as_str().as_bytes();
        let mut id = Vec::with_capacity(4 + name.len() + encoded_key.len() + 8);
        id.extend_from_slice(&(name.len() as u32).to_be_bytes());
        id.extend_from_slice(name);
        id.extend_from_slice(encoded_key);
        id.extend_from_slice(&timestamp.as_nanos().to_be_bytes());
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for HandoffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandoffId(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// redb-backed set of [`HandoffRecord`]s.
pub struct HandoffStore {
    db: Database,
    path: PathBuf,
}

impl HandoffStore {
    pub fn open(path: impl AsRef<Path>) -> HandoffResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;

        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(HANDOFFS_TABLE)?;
        }
        write_txn.commit()?;

        let store = Self { db, path };
        let recovered = store.recover()?;
        if recovered > 0 {
            info!(path = %store.path.display(), recovered, "reset interrupted deliveries to pending");
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores a new record. Returns false, leaving the stored record
    /// untouched, if the same segment write is already held.
    pub fn accept(&self, record: &HandoffRecord) -> HandoffResult<bool> {
        let id = record.id();
        let encoded = bincode::serialize(record)?;

        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(HANDOFFS_TABLE)?;
            if table.get(id.as_bytes())?.is_some() {
                false
            } else {
                table.insert(id.as_bytes(), encoded.as_slice())?;
                true
            }
        };
        write_txn.commit()?;

        if inserted {
            debug!(
                destination = %record.original_destination,
                key = %record.segment.key,
                segment = record.segment.segment_number,
                "accepted handoff"
            );
        }
        Ok(inserted)
    }

    pub fn get(&self, id: &HandoffId) -> HandoffResult<Option<HandoffRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HANDOFFS_TABLE)?;
        let record = match table.get(id.as_bytes())? {
            Some(value) => Some(bincode::deserialize(value.value())?),
            None => None,
        };
        Ok(record)
    }

    /// Records in id order, i.e. grouped by destination.
    pub fn all(&self) -> HandoffResult<Vec<(HandoffId, HandoffRecord)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HANDOFFS_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let record: HandoffRecord = bincode::deserialize(value.value())?;
            records.push((HandoffId(key.value().to_vec()), record));
        }
        Ok(records)
    }

    /// Records waiting for delivery.
    pub fn pending(&self) -> HandoffResult<Vec<(HandoffId, HandoffRecord)>> {
        let mut records = self.all()?;
        records.retain(|(_, record)| record.state == HandoffState::Pending);
        Ok(records)
    }

    /// Updates a record's state, counting a failed attempt if asked.
    /// Returns false if the record is gone.
    pub fn set_state(
        &self,
        id: &HandoffId,
        state: HandoffState,
        failed_attempt: bool,
    ) -> HandoffResult<bool> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(HANDOFFS_TABLE)?;
            let current: Option<HandoffRecord> = match table.get(id.as_bytes())? {
                Some(value) => Some(bincode::deserialize(value.value())?),
                None => None,
            };
            match current {
                Some(mut record) => {
                    record.state = state;
                    if failed_attempt {
                        record.attempts = record.attempts.saturating_add(1);
                    }
                    table.insert(id.as_bytes(), bincode::serialize(&record)?.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    /// Deletes a record. Returns false if it was already gone.
    pub fn remove(&self, id: &HandoffId) -> HandoffResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(HANDOFFS_TABLE)?;
            table.remove(id.as_bytes())?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn len(&self) -> HandoffResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HANDOFFS_TABLE)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> HandoffResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Puts deliveries interrupted by a crash back to pending. An
    /// acknowledged record that was not yet deleted is deleted now.
    fn recover(&self) -> HandoffResult<usize> {
        let mut recovered = 0;
        for (id, record) in self.all()? {
            match record.state {
                HandoffState::Forwarded => {
                    self.set_state(&id, HandoffState::Pending, false)?;
                    recovered += 1;
                }
                HandoffState::Acknowledged => {
                    self.remove(&id)?;
                }
                HandoffState::Pending => {}
            }
        }
        Ok(recovered)
    }
}

impl fmt::Debug for HandoffStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
