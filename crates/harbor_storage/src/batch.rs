//! Atomic write batches.

use harbor_model::{ModelKey, Record};
use serde::{Deserialize, Serialize};

/// A single storage mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Inserts or replaces a record.
    Put {
        /// Primary key of the record.
        key: ModelKey,
        /// The record; its model type names the table.
        record: Record,
    },
    /// Removes a record. Removing an absent record is a no-op.
    Delete {
        /// Model type.
        model: String,
        /// Primary key.
        key: ModelKey,
    },
    /// Writes a metadata entry.
    PutMeta {
        /// Metadata namespace, e.g. `outbox`.
        namespace: String,
        /// Entry key within the namespace.
        key: String,
        /// Opaque value.
        value: Vec<u8>,
    },
    /// Removes a metadata entry.
    DeleteMeta {
        /// Metadata namespace.
        namespace: String,
        /// Entry key.
        key: String,
    },
    /// Drops every record and every metadata entry.
    Clear,
}

/// An ordered set of operations committed all-or-nothing.
///
/// ```
/// use harbor_model::{ModelKey, Record};
/// use harbor_storage::WriteBatch;
///
/// let mut batch = WriteBatch::new();
/// batch.put(ModelKey::from("p1"), Record::new("Post").with("id", "p1"));
/// batch.put_meta("outbox", "00000001", vec![0xA0]);
/// assert_eq!(batch.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record write.
    pub fn put(&mut self, key: ModelKey, record: Record) -> &mut Self {
        self.ops.push(WriteOp::Put { key, record });
        self
    }

    /// Adds a record removal.
    pub fn delete(&mut self, model: impl Into<String>, key: ModelKey) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            model: model.into(),
            key,
        });
        self
    }

    /// Adds a metadata write.
    pub fn put_meta(
        &mut self,
        namespace: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> &mut Self {
        self.ops.push(WriteOp::PutMeta {
            namespace: namespace.into(),
            key: key.into(),
            value,
        });
        self
    }

    /// Adds a metadata removal.
    pub fn delete_meta(&mut self, namespace: impl Into<String>, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::DeleteMeta {
            namespace: namespace.into(),
            key: key.into(),
        });
        self
    }

    /// Adds a full wipe. Operations after it in the same batch still apply.
    pub fn clear(&mut self) -> &mut Self {
        self.ops.push(WriteOp::Clear);
        self
    }

    /// Appends raw operations.
    pub fn extend(&mut self, ops: impl IntoIterator<Item = WriteOp>) -> &mut Self {
        self.ops.extend(ops);
        self
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when there is nothing to commit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The operations in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
