//! # HarborDB Core
//!
//! The storage engine: the single entry point applications use to read and
//! write records.
//!
//! This crate provides:
//! - [`StorageEngine`] - save, query and delete against local storage
//! - [`Outbox`] - the durable queue of local mutations awaiting the remote
//! - [`EventBus`] - fan-out of every committed mutation as a [`MutationEvent`]
//! - [`LazyReference`] / [`LazyList`] - relationship proxies on loaded [`Model`]s
//! - [`QueryObservation`] - live query result sets
//!
//! Every write runs one atomic storage batch holding the record change and,
//! for replicated models, its outbox entry. The mutation event is published
//! after that batch commits.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod config;
mod engine;
mod error;
mod event;
mod invalidation;
mod lazy;
mod model;
mod observe;
mod outbox;
mod remote;

pub use bus::{EventBus, Listener, Subscription};
pub use config::EngineConfig;
pub use engine::StorageEngine;
pub use error::{CoreError, CoreResult};
pub use event::{MutationEvent, MutationKind, MutationSource};
pub use lazy::{Identifier, LazyList, LazyReference, ListState, ReferenceState};
pub use model::{Model, Relation};
pub use observe::{QueryObservation, QuerySnapshot};
pub use outbox::{Outbox, OutboxEntry, OUTBOX_NAMESPACE};
pub use remote::{ApplyOutcome, RemoteFetch, RemoteRecord};
