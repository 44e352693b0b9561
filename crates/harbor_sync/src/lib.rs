//! # HarborDB Sync
//!
//! The reconciler that keeps a local [`harbor_core::StorageEngine`] and a
//! remote service converging.
//!
//! This crate provides:
//! - Outbound drain of the engine's outbox, FIFO per key
//! - Optimistic version checks and conflict resolution
//! - Retry with exponential backoff and jitter
//! - Inbound merge of the remote change stream with persisted cursors
//! - A [`RemoteService`] contract and an in-memory [`MockRemote`]
//!
//! ## Key Invariants
//!
//! - At most one send is in flight per (model, key)
//! - Mutations for one key reach the remote in commit order
//! - A remote change never overwrites a record with pending local mutations
//! - Re-applying an already merged remote change is a no-op

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod mock;
mod policy;
mod reconciler;
mod remote;
mod state;

pub use config::{RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use mock::MockRemote;
pub use policy::{ConflictHandler, ConflictPolicy, ConflictWinner, Resolution};
pub use reconciler::{Reconciler, RemoteFetcher, CURSOR_NAMESPACE};
pub use remote::{RemoteChange, RemoteMutation, RemoteOutcome, RemoteService};
pub use state::{ModelState, SyncEvent, SyncStats};
