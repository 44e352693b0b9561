//! Conflict resolution.

use harbor_core::{MutationEvent, RemoteRecord};
use std::fmt;
use std::sync::Arc;

/// What to do with a local mutation the remote rejected as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite local state with the remote record and discard queued
    /// local mutations for the key.
    AcceptRemote,
    /// Resend the local mutation against the remote's current version.
    RetryLocal,
}

/// Which side won a resolved conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    /// The remote record was kept.
    Remote,
    /// The local mutation was resent.
    Local,
}

/// A user-supplied conflict strategy.
pub trait ConflictHandler: Send + Sync {
    /// Chooses between the rejected local mutation and the remote record.
    fn resolve(&self, local: &MutationEvent, remote: &RemoteRecord) -> Resolution;
}

/// Conflict resolution policy.
///
/// Whatever the policy, a remote deletion at or above the local mutation's
/// version wins; ties go to the delete.
#[derive(Clone, Default)]
pub enum ConflictPolicy {
    /// A newer remote version wins.
    #[default]
    RemoteWins,
    /// The local mutation is rebased and resent.
    LocalWins,
    /// The side with the later modification time wins.
    LastWriteWins,
    /// Delegates to a handler.
    Custom(Arc<dyn ConflictHandler>),
}

impl ConflictPolicy {
    /// Decides a conflict.
    pub fn resolve(&self, local: &MutationEvent, remote: &RemoteRecord) -> Resolution {
        let remote_newer = remote.version > local.version;
        if remote.deleted && remote.version >= local.version {
            return Resolution::AcceptRemote;
        }
        match self {
            ConflictPolicy::RemoteWins if remote_newer => Resolution::AcceptRemote,
            ConflictPolicy::RemoteWins | ConflictPolicy::LocalWins => Resolution::RetryLocal,
            ConflictPolicy::LastWriteWins => {
                if remote.record.last_changed_at() > local.created_at {
                    Resolution::AcceptRemote
                } else {
                    Resolution::RetryLocal
                }
            }
            ConflictPolicy::Custom(handler) => handler.resolve(local, remote),
        }
    }
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::RemoteWins => f.write_str("RemoteWins"),
            ConflictPolicy::LocalWins => f.write_str("LocalWins"),
            ConflictPolicy::LastWriteWins => f.write_str("LastWriteWins"),
            ConflictPolicy::Custom(_) => f.write_str("Custom"),
        }
    }
}
