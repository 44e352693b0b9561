//! Error types for storage operations.

use harbor_model::ModelError;
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the log.
    #[error("read beyond end of log: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current log size.
        size: u64,
    },

    /// Persisted data failed validation.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A write batch could not be encoded or a frame decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The adapter has been closed.
    #[error("storage is closed")]
    Closed,

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// A thread-confined adapter was used from a foreign thread.
    #[error("storage is confined to thread {owner}")]
    WrongThread {
        /// Debug rendering of the owning thread id.
        owner: String,
    },

    /// A record could not be interpreted.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// The caller supplied an invalid argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Returns true if the adapter is unusable rather than the request invalid.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Closed | StorageError::Locked)
    }
}
