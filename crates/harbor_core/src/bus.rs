//! Mutation event bus.
//!
//! Every committed local or remote write is published here once. Two kinds
//! of consumers exist:
//!
//! - **Listeners** run synchronously inside `publish`. They must be cheap and
//!   must not call back into the engine; the lazy-relationship invalidation
//!   tracker and the reconciler's wake-up signal are listeners.
//! - **Subscriptions** receive events over a bounded queue. A full queue
//!   drops the event for that subscriber only; publishers never block.
//!
//! Dropping a [`Subscription`] cancels it.

use crate::event::MutationEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Synchronous event hook.
pub type Listener = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    model: Option<String>,
    tx: SyncSender<MutationEvent>,
    dropped: Arc<AtomicU64>,
}

/// In-process fan-out of mutation events.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    listeners: RwLock<Vec<Listener>>,
    capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    /// Creates a bus with `capacity` buffered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribes to every event.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_inner(None)
    }

    /// Subscribes to events of one model type.
    pub fn subscribe_model(&self, model: impl Into<String>) -> Subscription {
        self.subscribe_inner(Some(model.into()))
    }

    fn subscribe_inner(&self, model: Option<String>) -> Subscription {
        let (tx, rx) = mpsc::sync_channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.write().push(Subscriber {
            id,
            model,
            tx,
            dropped: Arc::clone(&dropped),
        });
        Subscription { id, rx, dropped }
    }

    /// Registers a synchronous listener.
    pub fn add_listener(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    /// Publishes an event to listeners, then to subscribers.
    pub fn publish(&self, event: &MutationEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        for listener in self.listeners.read().iter() {
            listener(event);
        }

        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sub| {
            if sub.model.as_deref().is_some_and(|m| m != event.model) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = sub.id,
                        model = %event.model,
                        "subscriber queue full, event dropped"
                    );
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Live subscriptions, counting cancelled ones not yet pruned.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Events published so far.
    pub fn published_events(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Deliveries dropped because a subscriber queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A live, cancellable stream of mutation events.
///
/// Iterating blocks until the next event arrives.
pub struct Subscription {
    id: u64,
    rx: Receiver<MutationEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Subscription id, as shown in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event.
    pub fn recv(&self) -> Option<MutationEvent> {
        self.rx.recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<MutationEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&self) -> Option<MutationEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drains every buffered event.
    pub fn drain(&self) -> Vec<MutationEvent> {
        self.rx.try_iter().collect()
    }

    /// Events this subscription missed because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops delivery. Equivalent to dropping the subscription.
    pub fn cancel(self) {}
}

impl Iterator for Subscription {
    type Item = MutationEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}
