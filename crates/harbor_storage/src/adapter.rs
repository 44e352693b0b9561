//! The storage adapter contract consumed by the engine.

use crate::batch::WriteBatch;
use crate::error::StorageResult;
use crate::query::QueryOptions;
use harbor_model::{ModelKey, Predicate, Record};
use serde::Serialize;
use std::collections::BTreeMap;

/// A durable, key-addressable table store.
///
/// Implementations must provide:
/// - **Atomic batches**: `apply` commits every operation of a batch or none
/// - **Snapshot reads**: a read never observes half of a batch
/// - **Predicate evaluation**: `query` filters with [`Predicate::evaluate`]
///   against the stored representation
///
/// Metadata is a separate keyspace of opaque byte values grouped by
/// namespace. The engine keeps its outbox and sync cursors there so they
/// commit in the same batch as the records they describe.
///
/// # Errors
///
/// Every call fails with [`StorageError::Closed`] after [`close`], and with
/// [`StorageError::WrongThread`] when a thread-confined adapter is used from
/// another thread.
///
/// # Thread Safety
///
/// Adapters are `Send + Sync` and take `&self` everywhere, so one adapter
/// can be shared behind an `Arc`. Concurrent `apply` calls are serialized.
///
/// # Example
///
/// ```
/// use harbor_model::{ModelKey, Record};
/// use harbor_storage::{MemoryStore, StorageAdapter, WriteBatch};
///
/// let store = MemoryStore::in_memory();
/// let mut batch = WriteBatch::new();
/// batch.put(ModelKey::from("p1"), Record::new("Post").with("id", "p1"));
/// batch.put_meta("cursors", "Post", vec![7]);
/// store.apply(batch).unwrap();
///
/// assert!(store.exists("Post", &ModelKey::from("p1")).unwrap());
/// assert_eq!(store.meta_get("cursors", "Post").unwrap(), Some(vec![7]));
/// ```
///
/// [`close`]: StorageAdapter::close
/// [`StorageError::Closed`]: crate::StorageError::Closed
/// [`StorageError::WrongThread`]: crate::StorageError::WrongThread
pub trait StorageAdapter: Send + Sync {
    /// Reads one record.
    fn get(&self, model: &str, key: &ModelKey) -> StorageResult<Option<Record>>;

    /// True if a record with this key is stored.
    fn exists(&self, model: &str, key: &ModelKey) -> StorageResult<bool> {
        Ok(self.get(model, key)?.is_some())
    }

    /// Reads every record of `model` matching `predicate`, shaped by `options`.
    ///
    /// Records whose fields do not match the compared type are filtered out
    /// rather than reported.
    fn query(
        &self,
        model: &str,
        predicate: Option<&Predicate>,
        options: &QueryOptions,
    ) -> StorageResult<Vec<Record>>;

    /// Counts the records of `model` matching `predicate`.
    fn count(&self, model: &str, predicate: Option<&Predicate>) -> StorageResult<usize>;

    /// Commits a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be encoded or made durable. No
    /// operation of a failed batch is visible to readers.
    fn apply(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Reads one metadata entry.
    fn meta_get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Reads every entry of a namespace in key order.
    fn meta_scan(&self, namespace: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Summary of the stored data.
    fn stats(&self) -> StorageResult<StoreStats>;

    /// Fails unless the calling thread may use the adapter right now.
    fn check_access(&self) -> StorageResult<()>;

    /// False once the adapter has been closed.
    fn is_available(&self) -> bool;

    /// Makes the adapter unavailable. Further calls fail with `Closed`.
    fn close(&self);
}

/// Summary of an adapter's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Record count per model type.
    pub records: BTreeMap<String, usize>,
    /// Entry count per metadata namespace.
    pub metadata: BTreeMap<String, usize>,
    /// Size of the durable log in bytes.
    pub log_bytes: u64,
    /// Frames in the log since it was last compacted.
    pub frames: u64,
}
