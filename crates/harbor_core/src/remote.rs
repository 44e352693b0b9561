//! Types exchanged with the sync layer.

use crate::error::CoreResult;
use crate::event::MutationEvent;
use harbor_model::{ModelKey, Record};

/// A record as the remote service knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    /// Remote payload. For deletions, the last known state.
    pub record: Record,
    /// Remote version.
    pub version: u64,
    /// True if the remote has deleted the record.
    pub deleted: bool,
}

impl RemoteRecord {
    /// A live remote record.
    pub fn present(record: Record, version: u64) -> Self {
        Self {
            record,
            version,
            deleted: false,
        }
    }

    /// A remote deletion.
    pub fn deleted(record: Record, version: u64) -> Self {
        Self {
            record,
            version,
            deleted: true,
        }
    }
}

/// Outcome of merging an inbound remote record.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Written locally; the published event is returned.
    Applied(MutationEvent),
    /// Version not newer than the local one; nothing changed.
    Stale,
    /// Local mutations for the key are still queued; the outbound send
    /// resolves the divergence instead.
    PendingLocal,
}

impl ApplyOutcome {
    /// True if local storage changed.
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

/// Fetches a single record from the remote service on demand.
///
/// Lazy references consult it when the target is not stored locally.
pub trait RemoteFetch: Send + Sync {
    /// Returns the remote record, or `None` if the remote does not know it.
    fn fetch(&self, model: &str, key: &ModelKey) -> CoreResult<Option<RemoteRecord>>;
}
