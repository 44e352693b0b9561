//! Generation tracking for lazy relationship caches.
//!
//! Every mutation event bumps two kinds of counters:
//! - the record's own `(model, key)`
//! - for each has-many association pointing at the record's model, the
//!   parent key read from the record's foreign-key fields
//!
//! A lazy proxy remembers the tracker's clock when it loaded and is stale
//! once any counter it depends on has moved past that value.
//!
//! Counters at or below the oldest live load can no longer mark anything
//! stale and are pruned. Past [`MAX_SLOTS`] the oldest counters are evicted
//! and folded into a floor, so a long-lived cache may reload early but
//! never serves stale data.

use crate::event::MutationEvent;
use harbor_model::{ModelKey, ModelRegistry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Slot count below which pruning is skipped.
const PRUNE_AT: usize = 64;

/// Hard bound on retained slots.
pub(crate) const MAX_SLOTS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Slot {
    Record {
        model: String,
        key: ModelKey,
    },
    Children {
        model: String,
        fields: Vec<String>,
        parent: ModelKey,
    },
}

#[derive(Default)]
struct Clock {
    now: u64,
    floor: u64,
    slots: HashMap<Slot, u64>,
    /// Live load clocks and how many caches hold each.
    marks: BTreeMap<u64, usize>,
    next_prune: usize,
}

impl Clock {
    fn prune(&mut self) {
        let oldest = self.marks.keys().next().copied().unwrap_or(self.now);
        self.slots.retain(|_, generation| *generation > oldest);

        if self.slots.len() > MAX_SLOTS {
            let mut generations: Vec<u64> = self.slots.values().copied().collect();
            generations.sort_unstable();
            let cutoff = generations[generations.len() - MAX_SLOTS / 2];
            self.slots.retain(|_, generation| *generation >= cutoff);
            self.floor = self.floor.max(cutoff - 1);
            debug!(floor = self.floor, retained = self.slots.len(), "slots evicted");
        }

        self.next_prune = PRUNE_AT.max(self.slots.len() * 2).min(MAX_SLOTS + 1);
    }
}

/// Registration of one cached load. Slots it could still observe are kept
/// until it is dropped.
pub(crate) struct LoadMark {
    tracker: Arc<InvalidationTracker>,
    loaded_at: u64,
}

impl LoadMark {
    /// Clock value when the load started.
    pub(crate) fn loaded_at(&self) -> u64 {
        self.loaded_at
    }
}

impl Drop for LoadMark {
    fn drop(&mut self) {
        let mut clock = self.tracker.clock.lock();
        let oldest = clock.marks.keys().next().copied();
        if let Some(count) = clock.marks.get_mut(&self.loaded_at) {
            *count -= 1;
            if *count == 0 {
                clock.marks.remove(&self.loaded_at);
                if oldest == Some(self.loaded_at) {
                    // The slots it pinned can go on the next event.
                    clock.next_prune = 0;
                }
            }
        }
    }
}

pub(crate) struct InvalidationTracker {
    registry: Arc<ModelRegistry>,
    clock: Mutex<Clock>,
}

impl InvalidationTracker {
    pub(crate) fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            clock: Mutex::new(Clock::default()),
        }
    }

    /// Current clock value.
    #[cfg(test)]
    pub(crate) fn now(&self) -> u64 {
        self.clock.lock().now
    }

    /// Registers a load starting now. Hold the mark as long as the loaded
    /// value is cached.
    pub(crate) fn mark(self: &Arc<Self>) -> LoadMark {
        let mut clock = self.clock.lock();
        let loaded_at = clock.now;
        *clock.marks.entry(loaded_at).or_default() += 1;
        LoadMark {
            tracker: Arc::clone(self),
            loaded_at,
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.clock.lock().slots.len()
    }

    /// True if any of `slots` moved after `loaded_at`.
    pub(crate) fn changed_since<'a>(
        &self,
        loaded_at: u64,
        slots: impl IntoIterator<Item = &'a Slot>,
    ) -> bool {
        let clock = self.clock.lock();
        if clock.floor > loaded_at {
            return true;
        }
        slots
            .into_iter()
            .any(|slot| clock.slots.get(slot).is_some_and(|g| *g > loaded_at))
    }

    /// Invalidates everything, e.g. after the store is cleared.
    pub(crate) fn reset(&self) {
        let mut clock = self.clock.lock();
        clock.now += 1;
        clock.floor = clock.now;
        clock.slots.clear();
    }

    /// Bumps every slot affected by `event`.
    pub(crate) fn observe(&self, event: &MutationEvent) {
        let mut slots = vec![Slot::Record {
            model: event.model.clone(),
            key: event.key.clone(),
        }];

        if let Ok(record) = event.record() {
            for (_, association) in self.registry.parents_of(&event.model) {
                let fields = association.key_fields().to_vec();
                if let Some(parent) = record.key_from_fields(&fields) {
                    slots.push(Slot::Children {
                        model: event.model.clone(),
                        fields,
                        parent,
                    });
                }
            }
        }

        let mut clock = self.clock.lock();
        clock.now += 1;
        let now = clock.now;
        for slot in slots {
            trace!(?slot, generation = now, "slot invalidated");
            clock.slots.insert(slot, now);
        }
        if clock.next_prune == 0 || clock.slots.len() >= clock.next_prune {
            clock.prune();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MutationKind, MutationSource};
    use harbor_model::{ModelSchema, Record, ValueType};

    fn registry() -> Arc<ModelRegistry> {
        ModelRegistry::builder()
            .register(
                ModelSchema::builder("Post")
                    .field("id", ValueType::Id)
                    .has_many("comments", "Comment", &["postID"])
                    .build()
                    .unwrap(),
            )
            .register(
                ModelSchema::builder("Comment")
                    .field("id", ValueType::Id)
                    .optional("postID", ValueType::Id)
                    .belongs_to("post", "Post", &["postID"])
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn comment_event(id: &str, post: &str) -> MutationEvent {
        MutationEvent::build(
            MutationKind::Create,
            &Record::new("Comment").with("id", id).with("postID", post),
            ModelKey::from(id),
            MutationSource::Local,
            usize::MAX,
        )
        .unwrap()
    }

    fn children_of(post: &str) -> Slot {
        Slot::Children {
            model: "Comment".into(),
            fields: vec!["postID".into()],
            parent: ModelKey::from(post),
        }
    }

    #[test]
    fn child_event_bumps_parent_slot_only() {
        let tracker = InvalidationTracker::new(registry());
        let loaded_at = tracker.now();
        tracker.observe(&comment_event("c1", "p1"));

        assert!(tracker.changed_since(loaded_at, &[children_of("p1")]));
        assert!(!tracker.changed_since(loaded_at, &[children_of("p2")]));
        let record = Slot::Record {
            model: "Comment".into(),
            key: ModelKey::from("c1"),
        };
        assert!(tracker.changed_since(loaded_at, [&record]));
    }

    #[test]
    fn reset_invalidates_everything() {
        let tracker = InvalidationTracker::new(registry());
        tracker.observe(&comment_event("c1", "p1"));
        let loaded_at = tracker.now();
        assert!(!tracker.changed_since(loaded_at, &[children_of("p9")]));
        tracker.reset();
        assert!(tracker.changed_since(loaded_at, &[children_of("p9")]));
    }

    fn post_event(kind: MutationKind, id: &str) -> MutationEvent {
        MutationEvent::build(
            kind,
            &Record::new("Post").with("id", id),
            ModelKey::from(id),
            MutationSource::Local,
            usize::MAX,
        )
        .unwrap()
    }

    fn churn(tracker: &InvalidationTracker, count: usize) {
        for i in 0..count {
            let id = format!("p{i}");
            tracker.observe(&post_event(MutationKind::Create, &id));
            tracker.observe(&post_event(MutationKind::Delete, &id));
        }
    }

    #[test]
    fn slots_are_pruned_without_live_loads() {
        let tracker = InvalidationTracker::new(registry());
        churn(&tracker, 10_000);
        assert!(tracker.slot_count() < 100);
    }

    #[test]
    fn live_load_keeps_newer_slots() {
        let tracker = Arc::new(InvalidationTracker::new(registry()));
        let mark = tracker.mark();
        tracker.observe(&comment_event("c1", "p1"));
        churn(&tracker, 40);

        assert!(tracker.changed_since(mark.loaded_at(), &[children_of("p1")]));
        assert!(!tracker.changed_since(mark.loaded_at(), &[children_of("p2")]));
    }

    #[test]
    fn pinned_slots_are_capped_and_fold_into_the_floor() {
        let tracker = Arc::new(InvalidationTracker::new(registry()));
        let old = tracker.mark();
        churn(&tracker, 10_000);
        assert!(tracker.slot_count() <= MAX_SLOTS);
        // Evicted history forces the old load to reload.
        assert!(tracker.changed_since(old.loaded_at(), &[children_of("nothing")]));

        let fresh = tracker.mark();
        assert!(!tracker.changed_since(fresh.loaded_at(), &[children_of("nothing")]));

        drop(old);
        drop(fresh);
        churn(&tracker, 100);
        assert!(tracker.slot_count() < 100);
    }
}
