//! Query observation.

use crate::bus::Subscription;
use crate::engine::StorageEngine;
use crate::error::CoreResult;
use harbor_model::{Predicate, Record};
use std::time::Duration;

/// The result set of an observed query at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    /// Matching records in primary-key order.
    pub items: Vec<Record>,
    /// True once the model has completed an initial sync.
    pub is_synced: bool,
}

/// A live query: yields the current result set, then a fresh one after
/// every committed change to the observed model.
///
/// Events that arrive together are folded into one snapshot. Dropping the
/// observation cancels it.
pub struct QueryObservation {
    engine: StorageEngine,
    model: String,
    predicate: Option<Predicate>,
    events: Subscription,
    primed: bool,
}

impl QueryObservation {
    pub(crate) fn new(engine: StorageEngine, model: &str, predicate: Option<Predicate>) -> Self {
        let events = engine.observe(model);
        Self {
            engine,
            model: model.to_string(),
            predicate,
            events,
            primed: false,
        }
    }

    /// Evaluates the query now.
    pub fn snapshot(&self) -> CoreResult<QuerySnapshot> {
        let items = self
            .engine
            .query(&self.model, self.predicate.as_ref())?
            .into_iter()
            .map(Into::into)
            .collect();
        Ok(QuerySnapshot {
            items,
            is_synced: self.engine.is_model_synced(&self.model),
        })
    }

    /// Like `next`, but gives up after `timeout` without a change.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<CoreResult<QuerySnapshot>> {
        if !self.primed {
            self.primed = true;
            return Some(self.snapshot());
        }
        self.events.recv_timeout(timeout)?;
        self.events.drain();
        Some(self.snapshot())
    }

    /// Stops the observation.
    pub fn cancel(self) {}
}

impl Iterator for QueryObservation {
    type Item = CoreResult<QuerySnapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            return Some(self.snapshot());
        }
        self.events.recv()?;
        self.events.drain();
        Some(self.snapshot())
    }
}
