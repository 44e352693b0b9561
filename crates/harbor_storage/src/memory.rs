//! In-memory log backend.

use crate::backend::LogBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory log backend.
///
/// Clones share the same buffer, so a test can keep a handle, drop the
/// adapter, and reopen a new adapter over the surviving bytes to exercise
/// recovery.
///
/// # Thread Safety
///
/// The buffer sits behind an `RwLock`, so clones may be used from any
/// thread.
///
/// # Example
///
/// ```
/// use harbor_storage::{LogBackend, MemoryLog};
///
/// let mut log = MemoryLog::new();
/// let offset = log.append(b"frame").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(log.size().unwrap(), 5);
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log holding pre-existing bytes, e.g. a truncated copy of
    /// another log to simulate a crash mid-write.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Copy of the current bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl LogBackend for MemoryLog {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        if new_size > data.len() as u64 {
            return Err(StorageError::InvalidInput(format!(
                "cannot truncate to {} bytes, log is {} bytes",
                new_size,
                data.len()
            )));
        }
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> StorageResult<()> {
        *self.data.write() = bytes.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut log = MemoryLog::new();
        assert_eq!(log.append(b"hello").unwrap(), 0);
        assert_eq!(log.append(b" world").unwrap(), 5);
        assert_eq!(log.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut log = MemoryLog::new();
        log.append(b"abc").unwrap();
        assert!(matches!(
            log.read_at(2, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn clones_share_bytes() {
        let mut log = MemoryLog::new();
        let observer = log.clone();
        log.append(b"shared").unwrap();
        assert_eq!(observer.data(), b"shared");
    }

    #[test]
    fn truncate_and_replace() {
        let mut log = MemoryLog::with_data(b"hello world".to_vec());
        log.truncate(5).unwrap();
        assert_eq!(log.data(), b"hello");
        assert!(log.truncate(50).is_err());
        log.replace(b"new").unwrap();
        assert_eq!(log.data(), b"new");
    }
}
