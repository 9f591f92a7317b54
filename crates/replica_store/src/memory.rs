//! In-memory media for tests and ephemeral replicas.

use crate::backend::{LogDevice, SnapshotSlot};
use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory journal log.
///
/// Clones share the same bytes. Dropping a store and reopening another one
/// over a clone behaves like a process relaunch over the same files.
///
/// # Example
///
/// ```rust
/// use replica_store::{LogDevice, MemoryLog};
///
/// let mut log = MemoryLog::new();
/// let handle = log.clone();
/// log.append(b"frame").unwrap();
/// assert_eq!(handle.len().unwrap(), 5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemoryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log preloaded with raw bytes, e.g. a deliberately torn tail.
    #[must_use]
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Returns a copy of the raw bytes.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl LogDevice for MemoryLog {
    fn len(&self) -> StoreResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn read_from(&self, offset: u64) -> StoreResult<Vec<u8>> {
        let bytes = self.bytes.read();
        let start = usize::try_from(offset)
            .map_err(|_| StoreError::corrupted("log offset does not fit in memory"))?;
        if start > bytes.len() {
            return Err(StoreError::corrupted(format!(
                "read offset {offset} beyond log length {}",
                bytes.len()
            )));
        }
        Ok(bytes[start..].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let mut bytes = self.bytes.write();
        let offset = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        let mut bytes = self.bytes.write();
        if len > bytes.len() as u64 {
            return Err(StoreError::corrupted(format!(
                "cannot truncate log of {} bytes to {len}",
                bytes.len()
            )));
        }
        bytes.truncate(len as usize);
        Ok(())
    }
}

/// An in-memory snapshot slot. Clones share the same image.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    image: Arc<RwLock<Option<Vec<u8>>>>,
}

impl MemorySnapshot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotSlot for MemorySnapshot {
    fn load(&self) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.image.read().clone())
    }

    fn save(&mut self, image: &[u8]) -> StoreResult<()> {
        *self.image.write() = Some(image.to_vec());
        Ok(())
    }
}
