//! Byte log backend trait.

use crate::error::StorageResult;

/// An append-only byte log underneath [`crate::LogAdapter`].
///
/// Backends are **opaque byte stores**; framing, checksums and the meaning
/// of the bytes belong to the adapter.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - after `sync` returns, appended bytes survive process termination
/// - `replace` swaps the whole content atomically: readers observe either
///   the old or the new bytes, never a mix
///
/// # Thread Safety
///
/// Backends must be `Send + Sync`. Mutating methods take `&mut self`; the
/// adapter serializes them behind its own lock.
pub trait LogBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The range extends beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the OS.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes all appended data durable.
    ///
    /// Stronger than `flush`: after this returns, the bytes survive a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current size in bytes.
    fn size(&self) -> StorageResult<u64>;

    /// Drops everything after `new_size`. Used to cut a torn tail.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `new_size` is greater than the current size
    /// - The truncation fails
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole log. Used by compaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the new content cannot be written. The old
    /// content is then still in place.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the whole log.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }
}
