//! Store directory management.
//!
//! ```text
//! <store>/
//! ├─ LOCK        # advisory lock, one process at a time
//! └─ store.log   # frame log
//! ```

use crate::config::AdapterConfig;
use crate::error::{StorageError, StorageResult};
use crate::file::FileLog;
use crate::log_adapter::LogAdapter;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "store.log";

/// An exclusively locked store directory.
///
/// The lock is held for as long as this value lives.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens `path`, creating it when allowed, and takes the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the lock ([`StorageError::Locked`])
    /// - The directory is missing and `create_if_missing` is false
    /// - An I/O error occurs
    pub fn open(path: &Path, create_if_missing: bool) -> StorageResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::InvalidInput(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(StorageError::InvalidInput(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the frame log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }
}

/// Adapter over a [`FileLog`] inside a locked [`StoreDir`].
pub type FileStore = LogAdapter<FileLog>;

impl FileStore {
    /// Opens the store at `path`, replaying its log.
    ///
    /// # Errors
    ///
    /// Fails like [`StoreDir::open`] and [`LogAdapter::open`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use harbor_storage::{AdapterConfig, FileStore};
    /// use std::path::Path;
    ///
    /// let store = FileStore::open_dir(Path::new("blog.harbor"), AdapterConfig::default()).unwrap();
    /// ```
    pub fn open_dir(path: &Path, config: AdapterConfig) -> StorageResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        let log = FileLog::open(&dir.log_path())?;
        info!(path = %path.display(), "opening store");
        Self::recover(log, config, Some(dir))
    }
}
