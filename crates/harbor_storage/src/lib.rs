//! # HarborDB Storage
//!
//! The local storage adapter: durable, key-addressable tables per model
//! type with atomic batch writes and predicate queries.
//!
//! The shipped adapter, [`LogAdapter`], keeps tables in memory and appends
//! every committed [`WriteBatch`] to a checksummed frame log through a
//! [`LogBackend`]:
//!
//! - [`MemoryLog`]: in-memory, for tests and ephemeral stores
//! - [`FileLog`]: a single file inside a locked [`StoreDir`]
//!
//! ```
//! use harbor_model::{field, ModelKey, Record};
//! use harbor_storage::{MemoryStore, QueryOptions, StorageAdapter, WriteBatch};
//!
//! let store = MemoryStore::in_memory();
//! let mut batch = WriteBatch::new();
//! batch.put(ModelKey::from("p1"), Record::new("Post").with("id", "p1").with("rating", 4));
//! store.apply(batch).unwrap();
//!
//! let hits = store
//!     .query("Post", Some(&field("rating").gt(3)), &QueryOptions::default())
//!     .unwrap();
//! assert_eq!(hits.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod backend;
mod batch;
mod config;
mod dir;
mod error;
mod file;
mod frame;
mod log_adapter;
mod memory;
mod query;
mod tables;

pub use adapter::{StorageAdapter, StoreStats};
pub use backend::LogBackend;
pub use batch::{WriteBatch, WriteOp};
pub use config::AdapterConfig;
pub use dir::{FileStore, StoreDir};
pub use error::{StorageError, StorageResult};
pub use file::FileLog;
pub use log_adapter::{verify_log, CompactionReport, LogAdapter, LogReport, MemoryStore};
pub use memory::MemoryLog;
pub use query::{Page, QueryOptions, SortBy, SortOrder};
