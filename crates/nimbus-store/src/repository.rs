//! On-disk segment bytes.
//!
//! Each stored segment is one file named after the slot and the write
//! timestamp, so a replayed or stale write never clobbers a newer one:
//!
//! ```text
//! {repository}/{node}/segments/{tenant}/{md5(key)}.{version}.{segment}.{timestamp}
//! ```

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use nimbus_types::{NodeName, SegmentKey, Timestamp};
use tracing::debug;

use crate::error::StoreResult;

/// Segment file storage for one node.
#[derive(Debug, Clone)]
pub struct SegmentRepository {
    root: PathBuf,
}

impl SegmentRepository {
    pub fn new(repository_path: impl AsRef<Path>, node: &NodeName) -> Self {
        Self {
            root: repository_path.as_ref().join(node.as_str()).join("segments"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_path(&self, key: &SegmentKey, timestamp: Timestamp) -> PathBuf {
        let digest = md5::compute(&key.key);
        self.root.join(key.tenant_id.to_string()).join(format!(
            "{:x}.{}.{}.{}",
            digest, key.version_number, key.segment_number, timestamp
        ))
    }

    /// Durably writes the segment bytes. Rewriting the same slot and
    /// timestamp replaces the file atomically.
    pub fn write(&self, key: &SegmentKey, timestamp: Timestamp, data: &[u8]) -> StoreResult<PathBuf> {
        let path = self.segment_path(key, timestamp);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(data)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;

        debug!(key = %key, path = %path.display(), bytes = data.len(), "wrote segment");
        Ok(path)
    }

    /// Reads the segment bytes, `None` if no such file exists.
    pub fn read(&self, key: &SegmentKey, timestamp: Timestamp) -> StoreResult<Option<Bytes>> {
        match fs::read(self.segment_path(key, timestamp)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the segment file. Returns false if it did not exist.
    pub fn remove(&self, key: &SegmentKey, timestamp: Timestamp) -> StoreResult<bool> {
        match fs::remove_file(self.segment_path(key, timestamp)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
