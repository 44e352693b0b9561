//! Error types for the sync reconciler.

use harbor_core::CoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A remote call did not complete within the configured timeout.
    #[error("remote call timed out")]
    Timeout,

    /// The remote service is temporarily unavailable.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote rejected the mutation permanently.
    #[error("remote rejected mutation: {0}")]
    Rejected(String),

    /// The remote reported a version conflict that could not be resolved.
    #[error("unresolved conflict for {model} {key}")]
    Conflict {
        /// Model type.
        model: String,
        /// Rendered primary key.
        key: String,
    },

    /// Local engine error during sync.
    #[error("engine error: {0}")]
    Engine(#[from] CoreError),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The reconciler needs a Tokio runtime and none is running.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::Unavailable(_) => true,
            SyncError::Engine(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<SyncError> for CoreError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Engine(inner) => inner,
            SyncError::Conflict { model, key } => CoreError::SyncConflict {
                model,
                key,
                message: "remote version conflict".into(),
            },
            SyncError::Timeout => CoreError::Timeout {
                message: "remote call timed out".into(),
            },
            SyncError::Network { message, .. } | SyncError::Unavailable(message) => {
                CoreError::NetworkFailure { message }
            }
            other => CoreError::wrapped("sync failed", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::network_retryable("connection lost").is_retryable());
        assert!(!SyncError::network_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::Unavailable("maintenance".into()).is_retryable());
        assert!(!SyncError::Rejected("schema mismatch".into()).is_retryable());
    }

    #[test]
    fn converts_to_core_kinds() {
        assert!(matches!(
            CoreError::from(SyncError::Timeout),
            CoreError::Timeout { .. }
        ));
        assert!(matches!(
            CoreError::from(SyncError::network_retryable("down")),
            CoreError::NetworkFailure { .. }
        ));
        assert!(matches!(
            CoreError::from(SyncError::Conflict {
                model: "Post".into(),
                key: "p1".into()
            }),
            CoreError::SyncConflict { .. }
        ));
    }
}
