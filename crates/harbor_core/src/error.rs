//! Error types for the storage engine.

use harbor_model::ModelError;
use harbor_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The adapter is unavailable or misconfigured.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// The caller violated a precondition, or an internal step failed.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the violation.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A primary-key lookup matched more than one record.
    #[error("expected one {model}, found {count}")]
    NonUniqueResult {
        /// Model type.
        model: String,
        /// Number of matches.
        count: usize,
    },

    /// The record does not exist.
    #[error("{model} {key} not found")]
    NotFound {
        /// Model type.
        model: String,
        /// Rendered primary key.
        key: String,
    },

    /// Local and remote versions diverged.
    #[error("sync conflict on {model} {key}: {message}")]
    SyncConflict {
        /// Model type.
        model: String,
        /// Rendered primary key.
        key: String,
        /// Details.
        message: String,
    },

    /// The remote service could not be reached.
    #[error("network failure: {message}")]
    NetworkFailure {
        /// Details.
        message: String,
    },

    /// A remote call did not finish in time.
    #[error("timed out: {message}")]
    Timeout {
        /// Details.
        message: String,
    },

    /// A conditional write found a record that does not satisfy the condition.
    #[error("condition not met for {model} {key}")]
    ConditionFailed {
        /// Model type.
        model: String,
        /// Rendered primary key.
        key: String,
    },

    /// The record does not fit its schema.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Storage failure not covered by a more specific kind.
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl CoreError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error without a cause.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an invalid operation error wrapping `cause`.
    pub fn wrapped(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::InvalidOperation {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Creates a not found error.
    pub fn not_found(model: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            model: model.into(),
            key: key.to_string(),
        }
    }

    /// Maps a failed existence check: an unavailable adapter is a
    /// configuration problem, anything else an invalid operation.
    pub(crate) fn existence_check(err: StorageError) -> Self {
        if err.is_unavailable() {
            Self::configuration(err.to_string())
        } else {
            Self::wrapped("existence check failed", err)
        }
    }

    /// Returns true for transient failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkFailure { .. } | Self::Timeout { .. })
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Closed | StorageError::Locked => Self::configuration(err.to_string()),
            StorageError::WrongThread { .. } => {
                Self::wrapped("storage accessed from the wrong thread", err)
            }
            other => Self::Storage(other),
        }
    }
}
