//! Reconciler state, events and statistics.

use crate::policy::ConflictWinner;
use harbor_model::ModelKey;
use std::time::Instant;

/// Sync state of one managed model.
///
/// `Stopped → Starting → Syncing → {Error, Stopped}`. A model is
/// `Starting` until its first inbound pass catches up with the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelState {
    /// Not running.
    Stopped,
    /// Running, initial inbound pass not finished.
    Starting,
    /// Running and caught up at least once.
    Syncing,
    /// Inbound sync gave up; restart to resume.
    Error,
}

impl ModelState {
    /// Returns true while the reconciler runs for the model.
    pub fn is_active(&self) -> bool {
        matches!(self, ModelState::Starting | ModelState::Syncing)
    }
}

/// Progress notifications broadcast by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A model changed state.
    StateChanged {
        /// Model type.
        model: String,
        /// New state.
        state: ModelState,
    },
    /// A local mutation was applied remotely.
    OutboundApplied {
        /// Outbox sequence number.
        seq: u64,
        /// Model type.
        model: String,
        /// Primary key.
        key: ModelKey,
        /// Version assigned by the remote.
        version: u64,
    },
    /// A conflict was detected and resolved.
    ConflictResolved {
        /// Model type.
        model: String,
        /// Primary key.
        key: ModelKey,
        /// Winning side.
        winner: ConflictWinner,
    },
    /// A mutation could not be synced and was dropped from the outbox.
    TerminalFailure {
        /// Outbox sequence number.
        seq: u64,
        /// Model type.
        model: String,
        /// Primary key.
        key: ModelKey,
        /// Final error.
        error: String,
    },
    /// A remote change was merged locally.
    InboundApplied {
        /// Model type.
        model: String,
        /// Primary key.
        key: ModelKey,
        /// Remote version.
        version: u64,
    },
    /// A model finished its initial sync.
    ModelSynced {
        /// Model type.
        model: String,
    },
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Outbound sends attempted.
    pub sends: u64,
    /// Outbound mutations acknowledged by the remote.
    pub acknowledged: u64,
    /// Conflicts reported by the remote.
    pub conflicts: u64,
    /// Sends requeued after a transient failure.
    pub retries: u64,
    /// Mutations dropped after a terminal failure.
    pub terminal_failures: u64,
    /// Remote changes merged locally.
    pub inbound_applied: u64,
    /// Remote changes skipped as stale or shadowed by local mutations.
    pub inbound_skipped: u64,
    /// Time of the last acknowledged or merged change.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}
