//! The remote service contract.

use crate::error::{SyncError, SyncResult};
use harbor_core::{MutationEvent, MutationKind, RemoteRecord};
use harbor_model::{ModelKey, Record};
use std::future::Future;

/// A local mutation as sent to the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMutation {
    /// Model type.
    pub model: String,
    /// Primary key.
    pub key: ModelKey,
    /// Mutation kind.
    pub kind: MutationKind,
    /// Record payload. For deletions, the last local state.
    pub record: Record,
    /// Version the remote must currently hold for the mutation to apply.
    pub expected_version: u64,
}

impl RemoteMutation {
    /// Builds the outbound form of a queued event.
    pub fn from_event(event: &MutationEvent) -> SyncResult<Self> {
        Ok(Self {
            model: event.model.clone(),
            key: event.key.clone(),
            kind: event.kind,
            record: event.record().map_err(SyncError::Engine)?,
            expected_version: event.version,
        })
    }
}

/// Result of a mutation the remote accepted for validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Applied; the record now has `version`.
    Applied {
        /// New remote version.
        version: u64,
    },
    /// Rejected because the expected version is stale.
    Conflict,
}

/// One entry of the remote change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// The changed record and its version.
    pub remote: RemoteRecord,
    /// Stream position, passed back to resume after this change.
    pub cursor: u64,
}

/// The remote service the reconciler talks to.
///
/// Conflicts are a typed [`RemoteOutcome`], not an error. Errors are
/// transport failures and permanent rejections.
pub trait RemoteService: Send + Sync + 'static {
    /// Creates a record.
    fn create(
        &self,
        mutation: RemoteMutation,
    ) -> impl Future<Output = SyncResult<RemoteOutcome>> + Send;

    /// Replaces a record, if the remote holds `expected_version`.
    fn update(
        &self,
        mutation: RemoteMutation,
    ) -> impl Future<Output = SyncResult<RemoteOutcome>> + Send;

    /// Deletes a record, if the remote holds `expected_version`.
    fn delete(
        &self,
        mutation: RemoteMutation,
    ) -> impl Future<Output = SyncResult<RemoteOutcome>> + Send;

    /// The remote's current state of a record.
    fn fetch(
        &self,
        model: String,
        key: ModelKey,
    ) -> impl Future<Output = SyncResult<Option<RemoteRecord>>> + Send;

    /// Up to `limit` changes to `model` after stream position `cursor`, in
    /// stream order.
    fn poll(
        &self,
        model: String,
        cursor: u64,
        limit: usize,
    ) -> impl Future<Output = SyncResult<Vec<RemoteChange>>> + Send;
}

/// Sends `mutation` through the method matching its kind.
pub(crate) async fn send<S: RemoteService>(
    remote: &S,
    mutation: RemoteMutation,
) -> SyncResult<RemoteOutcome> {
    match mutation.kind {
        MutationKind::Create => remote.create(mutation).await,
        MutationKind::Update => remote.update(mutation).await,
        MutationKind::Delete => remote.delete(mutation).await,
    }
}
