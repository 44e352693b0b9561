//! Mutation outbox.
//!
//! A durable, ordered queue of local writes waiting to be sent to the
//! remote service. Entries live in the adapter's `outbox` metadata namespace
//! and are written in the same batch as the record change that produced
//! them, so a crash can never separate the two.
//!
//! ## Ordering
//!
//! - Entries get a monotonically increasing sequence number.
//! - [`Outbox::dequeue_next`] hands out the oldest entry whose key has no
//!   earlier entry still waiting, in flight, or backing off.
//! - At most one entry per `(model, key)` is in flight at any instant.
//!
//! ## Coalescing
//!
//! A new local mutation for a key whose newest entry has not been sent yet
//! replaces that entry instead of queuing behind it:
//!
//! | queued   | new      | result                 |
//! |----------|----------|------------------------|
//! | create   | update   | create, newest payload |
//! | create   | delete   | both dropped           |
//! | update   | update   | update, newest payload |
//! | update   | delete   | delete                 |
//! | delete   | create   | update, newest payload |
//!
//! An entry in flight is never touched, nor one whose earlier send failed
//! without a definite answer: the remote may already hold its effect. The
//! new mutation queues behind it instead.

use crate::error::{CoreError, CoreResult};
use crate::event::{MutationEvent, MutationKind};
use harbor_model::ModelKey;
use harbor_storage::{StorageAdapter, WriteBatch};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Metadata namespace holding persisted entries.
pub const OUTBOX_NAMESPACE: &str = "outbox";

/// A pending outbound mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Enqueue order.
    pub seq: u64,
    /// The mutation to send.
    pub event: MutationEvent,
    /// Failed send attempts so far.
    pub retry_count: u32,
    /// True while a send is outstanding.
    pub in_flight: bool,
    /// True once a send failed without a definite answer or the entry was
    /// recovered after a restart: the remote may already hold its effect.
    pub attempted: bool,
    not_before: Option<Instant>,
}

impl OutboxEntry {
    fn new(seq: u64, event: MutationEvent) -> Self {
        Self {
            seq,
            event,
            retry_count: 0,
            in_flight: false,
            attempted: false,
            not_before: None,
        }
    }

    fn same_key(&self, model: &str, key: &ModelKey) -> bool {
        self.event.model == model && &self.event.key == key
    }

    fn is_due(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    seq: u64,
    event: MutationEvent,
    retry_count: u32,
}

fn entry_key(seq: u64) -> String {
    format!("{seq:020}")
}

fn persist(entry: &OutboxEntry, batch: &mut WriteBatch) -> CoreResult<()> {
    let stored = PersistedEntry {
        seq: entry.seq,
        event: entry.event.clone(),
        retry_count: entry.retry_count,
    };
    let mut buf = Vec::new();
    ciborium::into_writer(&stored, &mut buf)
        .map_err(|e| CoreError::wrapped("failed to encode outbox entry", e))?;
    batch.put_meta(OUTBOX_NAMESPACE, entry_key(entry.seq), buf);
    Ok(())
}

enum Undo {
    Remove(u64),
    Restore(OutboxEntry),
}

/// In-memory outbox state. Mutations are staged into a write batch, then
/// either committed or rolled back depending on whether the batch applied.
pub(crate) struct OutboxState {
    entries: BTreeMap<u64, OutboxEntry>,
    next_seq: u64,
    undo: Vec<Undo>,
    undo_next_seq: u64,
}

impl OutboxState {
    fn latest_for(&self, model: &str, key: &ModelKey) -> Option<&OutboxEntry> {
        self.entries
            .values()
            .rev()
            .find(|e| e.same_key(model, key))
    }

    pub(crate) fn has_pending(&self, model: &str, key: &ModelKey) -> bool {
        self.entries.values().any(|e| e.same_key(model, key))
    }

    /// Stages `event`, adding its persistence operations to `batch`.
    pub(crate) fn stage(&mut self, event: MutationEvent, batch: &mut WriteBatch) -> CoreResult<()> {
        self.begin();

        let queued = self
            .latest_for(&event.model, &event.key)
            .filter(|e| !e.in_flight && !e.attempted)
            .map(|e| (e.seq, e.event.kind, e.event.version));

        match queued {
            Some((seq, MutationKind::Create, _)) if event.kind == MutationKind::Delete => {
                self.remove_staged(seq, batch);
                debug!(seq, model = %event.model, key = %event.key, "create and delete cancelled out");
            }
            Some((seq, queued_kind, version)) => {
                let kind = match (queued_kind, event.kind) {
                    (MutationKind::Create, _) => MutationKind::Create,
                    (MutationKind::Delete, MutationKind::Create) => MutationKind::Update,
                    (_, new_kind) => new_kind,
                };
                // The queued entry's expected version still describes the remote.
                let replacement = OutboxEntry::new(
                    seq,
                    MutationEvent {
                        kind,
                        version,
                        ..event
                    },
                );
                persist(&replacement, batch)?;
                if let Some(previous) = self.entries.insert(seq, replacement) {
                    self.undo.push(Undo::Restore(previous));
                }
                debug!(seq, ?kind, "outbox entry coalesced");
            }
            None => {
                let seq = self.next_seq;
                let entry = OutboxEntry::new(seq, event);
                persist(&entry, batch)?;
                self.next_seq += 1;
                self.entries.insert(seq, entry);
                self.undo.push(Undo::Remove(seq));
                debug!(seq, "outbox entry appended");
            }
        }
        Ok(())
    }

    fn begin(&mut self) {
        if self.undo.is_empty() {
            self.undo_next_seq = self.next_seq;
        }
    }

    /// Stages `entry` in place of the entry with the same sequence number.
    fn stage_replace(&mut self, entry: OutboxEntry, batch: &mut WriteBatch) -> CoreResult<()> {
        self.begin();
        persist(&entry, batch)?;
        if let Some(previous) = self.entries.insert(entry.seq, entry) {
            self.undo.push(Undo::Restore(previous));
        }
        Ok(())
    }

    fn remove_staged(&mut self, seq: u64, batch: &mut WriteBatch) -> Option<OutboxEntry> {
        batch.delete_meta(OUTBOX_NAMESPACE, entry_key(seq));
        let removed = self.entries.remove(&seq)?;
        self.undo.push(Undo::Restore(removed.clone()));
        Some(removed)
    }

    /// Stages removal of every entry for a key, in flight or not.
    pub(crate) fn stage_discard_key(
        &mut self,
        model: &str,
        key: &ModelKey,
        batch: &mut WriteBatch,
    ) -> usize {
        self.begin();
        let seqs: Vec<u64> = self
            .entries
            .values()
            .filter(|e| e.same_key(model, key))
            .map(|e| e.seq)
            .collect();
        for seq in &seqs {
            self.remove_staged(*seq, batch);
        }
        seqs.len()
    }

    /// Stages removal of one entry.
    pub(crate) fn stage_remove(&mut self, seq: u64, batch: &mut WriteBatch) -> Option<OutboxEntry> {
        self.begin();
        self.remove_staged(seq, batch)
    }

    /// Stages removal of an acknowledged entry and rebases later entries for
    /// the same key onto `version`.
    pub(crate) fn stage_acknowledge(
        &mut self,
        seq: u64,
        version: u64,
        batch: &mut WriteBatch,
    ) -> CoreResult<Option<OutboxEntry>> {
        let Some(acked) = self.stage_remove(seq, batch) else {
            return Ok(None);
        };
        let followers: Vec<OutboxEntry> = self
            .entries
            .values()
            .filter(|e| e.same_key(&acked.event.model, &acked.event.key))
            .cloned()
            .collect();
        for mut follower in followers {
            follower.event.version = version;
            self.stage_replace(follower, batch)?;
        }
        Ok(Some(acked))
    }

    /// Stages a state change of one entry; `None` if it no longer exists.
    fn stage_update(
        &mut self,
        seq: u64,
        batch: &mut WriteBatch,
        change: impl FnOnce(&mut OutboxEntry),
    ) -> CoreResult<Option<OutboxEntry>> {
        let Some(mut entry) = self.entries.get(&seq).cloned() else {
            return Ok(None);
        };
        change(&mut entry);
        self.stage_replace(entry.clone(), batch)?;
        Ok(Some(entry))
    }

    /// Keeps staged changes.
    pub(crate) fn commit(&mut self) {
        self.undo.clear();
    }

    /// Reverts staged changes after the batch failed to apply.
    pub(crate) fn rollback(&mut self) {
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Remove(seq) => {
                    self.entries.remove(&seq);
                }
                Undo::Restore(entry) => {
                    self.entries.insert(entry.seq, entry);
                }
            }
        }
        self.next_seq = self.undo_next_seq;
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
        self.undo.clear();
    }
}

/// Durable queue of outbound mutations.
pub struct Outbox {
    adapter: Arc<dyn StorageAdapter>,
    state: Mutex<OutboxState>,
}

impl Outbox {
    /// Loads persisted entries. In-flight flags do not survive a restart, so
    /// every loaded entry is pending again.
    pub fn load(adapter: Arc<dyn StorageAdapter>) -> CoreResult<Self> {
        let mut entries = BTreeMap::new();
        for (key, bytes) in adapter.meta_scan(OUTBOX_NAMESPACE)? {
            let stored: PersistedEntry = ciborium::from_reader(bytes.as_slice()).map_err(|e| {
                CoreError::wrapped(format!("unreadable outbox entry {key}"), e)
            })?;
            let mut entry = OutboxEntry::new(stored.seq, stored.event);
            entry.retry_count = stored.retry_count;
            // A crash may have interrupted a send that already landed.
            entry.attempted = true;
            entries.insert(entry.seq, entry);
        }
        let next_seq = entries.keys().next_back().map_or(1, |seq| seq + 1);
        if !entries.is_empty() {
            info!(pending = entries.len(), next_seq, "outbox recovered");
        }

        Ok(Self {
            adapter,
            state: Mutex::new(OutboxState {
                entries,
                next_seq,
                undo: Vec::new(),
                undo_next_seq: next_seq,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, OutboxState> {
        self.state.lock()
    }

    /// Enqueues `event` on its own, coalescing with an unsent entry for the
    /// same key.
    pub fn enqueue(&self, event: MutationEvent) -> CoreResult<()> {
        let mut state = self.state.lock();
        let mut batch = WriteBatch::new();
        state.stage(event, &mut batch)?;
        self.commit_staged(&mut state, batch)
    }

    fn commit_staged(&self, state: &mut OutboxState, batch: WriteBatch) -> CoreResult<()> {
        match self.adapter.apply(batch) {
            Ok(()) => {
                state.commit();
                Ok(())
            }
            Err(err) => {
                state.rollback();
                Err(err.into())
            }
        }
    }

    /// Marks the oldest sendable entry in flight and returns it.
    ///
    /// Returns `None` when the queue is empty or every remaining entry waits
    /// behind an earlier entry for its key.
    pub fn dequeue_next(&self) -> Option<OutboxEntry> {
        self.dequeue_where(|_| true)
    }

    /// Like [`Outbox::dequeue_next`], considering only entries accepted by
    /// `filter`.
    pub fn dequeue_where(&self, filter: impl Fn(&OutboxEntry) -> bool) -> Option<OutboxEntry> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut blocked: HashSet<(&str, &ModelKey)> = HashSet::new();
        let mut chosen = None;
        for entry in state.entries.values() {
            let id = (entry.event.model.as_str(), &entry.event.key);
            if blocked.contains(&id) {
                continue;
            }
            if !entry.in_flight && entry.is_due(now) && filter(entry) {
                chosen = Some(entry.seq);
                break;
            }
            blocked.insert(id);
        }
        let seq = chosen?;
        let entry = state.entries.get_mut(&seq)?;
        entry.in_flight = true;
        debug!(seq, model = %entry.event.model, key = %entry.event.key, "outbox entry in flight");
        Some(entry.clone())
    }

    /// Removes an entry after the remote applied it.
    ///
    /// Later entries for the same key are rebased onto `acknowledged_version`
    /// so they are not rejected as stale by the remote.
    pub fn acknowledge(&self, seq: u64, acknowledged_version: u64) -> CoreResult<()> {
        let mut state = self.state.lock();
        let mut batch = WriteBatch::new();
        if let Err(err) = state.stage_acknowledge(seq, acknowledged_version, &mut batch) {
            state.rollback();
            return Err(err);
        }
        self.commit_staged(&mut state, batch)?;
        debug!(seq, version = acknowledged_version, "outbox entry acknowledged");
        Ok(())
    }

    /// Returns an entry to the queue after a transient failure. It becomes
    /// eligible again after `delay`. Returns the new retry count.
    pub fn requeue(&self, seq: u64, delay: Duration) -> CoreResult<u32> {
        let not_before = Instant::now() + delay;
        let entry = self.update(seq, |entry| {
            entry.in_flight = false;
            entry.retry_count += 1;
            entry.attempted = true;
            entry.not_before = Some(not_before);
        })?;
        debug!(seq, retry = entry.retry_count, delay_ms = delay.as_millis() as u64, "outbox entry requeued");
        Ok(entry.retry_count)
    }

    /// [`Outbox::requeue`], additionally moving the entry onto `version`.
    pub fn requeue_rebased(&self, seq: u64, delay: Duration, version: u64) -> CoreResult<u32> {
        let not_before = Instant::now() + delay;
        let entry = self.update(seq, |entry| {
            entry.in_flight = false;
            entry.retry_count += 1;
            entry.not_before = Some(not_before);
            entry.event.version = version;
        })?;
        debug!(seq, retry = entry.retry_count, version, "outbox entry requeued onto remote version");
        Ok(entry.retry_count)
    }

    fn update(&self, seq: u64, change: impl FnOnce(&mut OutboxEntry)) -> CoreResult<OutboxEntry> {
        let mut state = self.state.lock();
        let mut batch = WriteBatch::new();
        let updated = match state.stage_update(seq, &mut batch, change) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return Err(CoreError::invalid_operation(format!(
                    "outbox entry {seq} does not exist"
                )))
            }
            Err(err) => {
                state.rollback();
                return Err(err);
            }
        };
        self.commit_staged(&mut state, batch)?;
        Ok(updated)
    }

    /// Drops an entry without sending it.
    pub fn discard(&self, seq: u64) -> CoreResult<Option<OutboxEntry>> {
        let mut state = self.state.lock();
        let mut batch = WriteBatch::new();
        let removed = state.stage_remove(seq, &mut batch);
        self.commit_staged(&mut state, batch)?;
        if let Some(entry) = &removed {
            warn!(seq, model = %entry.event.model, key = %entry.event.key, "outbox entry discarded");
        }
        Ok(removed)
    }

    /// True if any entry for the key is queued or in flight.
    pub fn has_pending(&self, model: &str, key: &ModelKey) -> bool {
        self.state.lock().has_pending(model, key)
    }

    /// Snapshot of every entry in sequence order.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Number of entries currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.in_flight)
            .count()
    }

    /// Time until the earliest entry still backing off becomes due.
    pub fn next_due_in(&self) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| !e.in_flight)
            .filter_map(|e| e.not_before)
            .filter(|t| *t > now)
            .map(|t| t - now)
            .min()
    }
}
