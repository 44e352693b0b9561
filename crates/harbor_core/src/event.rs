//! Mutation events.

use crate::error::{CoreError, CoreResult};
use harbor_model::{ModelKey, Record};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Kind of committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    /// No record existed under the key.
    Create,
    /// An existing record was replaced.
    Update,
    /// The record was removed.
    Delete,
}

/// Where a committed write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationSource {
    /// Application code through the engine.
    Local,
    /// The remote service, applied by the reconciler.
    Remote,
}

/// Immutable record of one committed create, update or delete.
///
/// The payload is the CBOR-encoded record. Delete events carry the record
/// as it was before removal so observers can still read its foreign keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Model type.
    pub model: String,
    /// Primary key.
    pub key: ModelKey,
    /// Kind of write.
    pub kind: MutationKind,
    /// Remote-acknowledged version of the record at commit.
    pub version: u64,
    /// Encoded record.
    pub payload: Vec<u8>,
    /// Commit time in milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Origin of the write.
    pub source: MutationSource,
}

impl MutationEvent {
    /// Builds an event for `record`.
    ///
    /// Fails with `InvalidOperation` if the record cannot be encoded or its
    /// encoding exceeds `max_payload_bytes`.
    pub fn build(
        kind: MutationKind,
        record: &Record,
        key: ModelKey,
        source: MutationSource,
        max_payload_bytes: usize,
    ) -> CoreResult<Self> {
        let payload = record
            .encode()
            .map_err(|e| CoreError::wrapped("failed to encode mutation event", e))?;
        if payload.len() > max_payload_bytes {
            return Err(CoreError::invalid_operation(format!(
                "{} {} payload is {} bytes, limit is {}",
                record.model(),
                key,
                payload.len(),
                max_payload_bytes
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            model: record.model().to_string(),
            key,
            kind,
            version: record.version(),
            payload,
            created_at: now_millis(),
            source,
        })
    }

    /// Decodes the payload.
    pub fn record(&self) -> CoreResult<Record> {
        Record::decode(&self.payload).map_err(CoreError::from)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
