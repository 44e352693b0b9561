//! File-backed log.

use crate::backend::LogBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A log stored in a single file.
///
/// Data survives process restarts. Use it through a [`crate::StoreDir`],
/// which holds the exclusive lock that keeps a second process out.
///
/// # Durability
///
/// - `flush()` pushes data to the OS
/// - `sync()` calls `File::sync_all()`
/// - `replace()` writes a sibling temp file, syncs it and renames it over
///   the log, so a crash leaves either the old or the new log in place
///
/// # Thread Safety
///
/// The log is `Send + Sync`. Reads share an internal file lock; writes need
/// `&mut self`.
///
/// # Example
///
/// ```no_run
/// use harbor_storage::{FileLog, LogBackend};
/// use std::path::Path;
///
/// let mut log = FileLog::open(Path::new("store.log")).unwrap();
/// log.append(b"frame").unwrap();
/// log.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileLog {
    /// Opens or creates the log at `path`.
    ///
    /// An existing file is opened for reading and appending with its
    /// content kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size,
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogBackend for FileLog {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let end = offset.saturating_add(len as u64);
        if offset > self.size || end > self.size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.size,
            });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.size;
        if data.is_empty() {
            return Ok(offset);
        }

        let file = self.file.get_mut();
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.get_mut().flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.get_mut().sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.size)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if new_size > self.size {
            return Err(StorageError::InvalidInput(format!(
                "cannot truncate to {} bytes, log is {} bytes",
                new_size, self.size
            )));
        }
        let file = self.file.get_mut();
        file.set_len(new_size)?;
        file.sync_all()?;
        self.size = new_size;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let temp_path = self.path.with_extension("log.tmp");
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(data)?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.size = file.metadata()?.len();
        *self.file.get_mut() = file;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");
        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");
        {
            let mut log = FileLog::open(&path).unwrap();
            log.append(b"persist").unwrap();
            log.sync().unwrap();
        }
        let log = FileLog::open(&path).unwrap();
        assert_eq!(log.read_all().unwrap(), b"persist");
    }

    #[test]
    fn truncate_cuts_tail() {
        let dir = tempdir().unwrap();
        let mut log = FileLog::open(&dir.path().join("store.log")).unwrap();
        log.append(b"hello world").unwrap();
        log.truncate(5).unwrap();
        assert_eq!(log.read_all().unwrap(), b"hello");
        assert!(log.truncate(10).is_err());
    }

    #[test]
    fn replace_swaps_content_and_keeps_appending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");
        let mut log = FileLog::open(&path).unwrap();
        log.append(b"old old old").unwrap();
        log.replace(b"new").unwrap();
        log.append(b"+tail").unwrap();
        assert_eq!(log.read_all().unwrap(), b"new+tail");
        assert!(!path.with_extension("log.tmp").exists());
    }
}
