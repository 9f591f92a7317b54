//! Media traits the store persists through.

use crate::error::StoreResult;

/// An append-only byte log holding journal frames.
///
/// Devices are opaque byte stores. They never interpret frames; the store owns
/// the journal format.
///
/// # Invariants
///
/// - `append` returns the offset where the bytes begin
/// - `read_from` returns every byte from `offset` to the current end
/// - after `sync` returns, all appended bytes survive process termination
pub trait LogDevice: Send + Sync {
    /// Returns the current length of the log in bytes.
    fn len(&self) -> StoreResult<u64>;

    /// Returns true if nothing has been appended.
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads everything from `offset` to the end of the log.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` is past the end or an I/O error occurs.
    fn read_from(&self, offset: u64) -> StoreResult<Vec<u8>>;

    /// Appends bytes to the end of the log, returning their offset.
    fn append(&mut self, bytes: &[u8]) -> StoreResult<u64>;

    /// Makes all appended bytes durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Discards everything after `len`.
    ///
    /// Used to drop a torn tail after a crash and to empty the log after a
    /// checkpoint.
    fn truncate(&mut self, len: u64) -> StoreResult<()>;
}

/// A single durable slot holding the latest checkpoint image.
pub trait SnapshotSlot: Send + Sync {
    /// Loads the stored image, or `None` if no checkpoint was ever taken.
    fn load(&self) -> StoreResult<Option<Vec<u8>>>;

    /// Replaces the stored image atomically: a crash leaves either the old or
    /// the new image, never a mix.
    fn save(&mut self, image: &[u8]) -> StoreResult<()>;
}
