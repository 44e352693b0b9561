//! An in-memory remote service for tests and demos.

use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteChange, RemoteMutation, RemoteOutcome, RemoteService};
use harbor_core::{MutationKind, RemoteRecord};
use harbor_model::{ModelKey, Record};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

type Key = (String, ModelKey);

#[derive(Default)]
struct MockState {
    records: HashMap<Key, RemoteRecord>,
    log: Vec<(String, RemoteRecord)>,
    applied: Vec<RemoteMutation>,
    conflicts: HashSet<Key>,
    failures: VecDeque<SyncError>,
    in_flight: HashMap<Key, usize>,
    max_in_flight: usize,
    latency: Duration,
    fetches: usize,
}

/// A remote service backed by a map, with an ordered change log.
///
/// Versions start at 1 and increase by one per applied change. Conflicts,
/// transport failures and latency can be injected.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `record` as another client would, returning the new version.
    pub fn remote_write(&self, key: ModelKey, record: Record) -> u64 {
        let mut state = self.state.lock();
        let id = (record.model().to_string(), key);
        let version = state.records.get(&id).map_or(0, |r| r.version) + 1;
        state.commit(id, RemoteRecord::present(record, version));
        version
    }

    /// Deletes a record as another client would. Returns the new version, or
    /// `None` if the remote does not hold the record.
    pub fn remote_delete(&self, model: &str, key: &ModelKey) -> Option<u64> {
        let mut state = self.state.lock();
        let id = (model.to_string(), key.clone());
        let current = state.records.get(&id).filter(|r| !r.deleted)?.clone();
        let version = current.version + 1;
        state.commit(id, RemoteRecord::deleted(current.record, version));
        Some(version)
    }

    /// Makes the next mutation for the key report a conflict, whatever its
    /// expected version.
    pub fn inject_conflict(&self, model: &str, key: &ModelKey) {
        self.state
            .lock()
            .conflicts
            .insert((model.to_string(), key.clone()));
    }

    /// Fails the next remote calls with `error`, one call per queued error.
    pub fn inject_failure(&self, error: SyncError) {
        self.state.lock().failures.push_back(error);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// The remote's state of a record.
    pub fn record(&self, model: &str, key: &ModelKey) -> Option<RemoteRecord> {
        self.state
            .lock()
            .records
            .get(&(model.to_string(), key.clone()))
            .cloned()
    }

    /// Mutations applied from the reconciler, in application order.
    pub fn applied(&self) -> Vec<RemoteMutation> {
        self.state.lock().applied.clone()
    }

    /// Highest number of concurrent calls observed for any single key.
    pub fn max_in_flight_per_key(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Number of fetch calls served.
    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches
    }

    /// Counts a call in for `id` until the returned guard drops.
    fn enter(&self, id: Key) -> InFlight<'_> {
        let mut state = self.state.lock();
        let count = state.in_flight.entry(id.clone()).or_default();
        *count += 1;
        let count = *count;
        state.max_in_flight = state.max_in_flight.max(count);
        InFlight { remote: self, id }
    }

    /// Applies latency, then the next injected failure if any.
    async fn pace(&self) -> SyncResult<()> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.state.lock().failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn mutate(&self, mutation: RemoteMutation) -> SyncResult<RemoteOutcome> {
        let id = (mutation.model.clone(), mutation.key.clone());
        let _call = self.enter(id.clone());
        self.pace().await?;
        let outcome = self.state.lock().apply(id, mutation);
        Ok(outcome)
    }
}

/// One counted call. Dropping it counts the call out, also when the caller
/// abandons the future mid-call.
struct InFlight<'a> {
    remote: &'a MockRemote,
    id: Key,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.remote.state.lock();
        if let Some(count) = state.in_flight.get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
    }
}

impl MockState {
    fn commit(&mut self, id: Key, remote: RemoteRecord) {
        self.log.push((id.0.clone(), remote.clone()));
        self.records.insert(id, remote);
    }

    fn apply(&mut self, id: Key, mutation: RemoteMutation) -> RemoteOutcome {
        if self.conflicts.remove(&id) {
            return RemoteOutcome::Conflict;
        }
        let current = self.records.get(&id);
        let live = current.filter(|r| !r.deleted);
        let accepted = match mutation.kind {
            MutationKind::Create => live.is_none(),
            MutationKind::Update | MutationKind::Delete => {
                live.map(|r| r.version) == Some(mutation.expected_version)
            }
        };
        if !accepted {
            return RemoteOutcome::Conflict;
        }

        let version = current.map_or(0, |r| r.version) + 1;
        let remote = match mutation.kind {
            MutationKind::Delete => RemoteRecord::deleted(mutation.record.clone(), version),
            MutationKind::Create | MutationKind::Update => {
                RemoteRecord::present(mutation.record.clone(), version)
            }
        };
        self.commit(id, remote);
        self.applied.push(mutation);
        RemoteOutcome::Applied { version }
    }
}

impl RemoteService for MockRemote {
    async fn create(&self, mutation: RemoteMutation) -> SyncResult<RemoteOutcome> {
        self.mutate(mutation).await
    }

    async fn update(&self, mutation: RemoteMutation) -> SyncResult<RemoteOutcome> {
        self.mutate(mutation).await
    }

    async fn delete(&self, mutation: RemoteMutation) -> SyncResult<RemoteOutcome> {
        self.mutate(mutation).await
    }

    async fn fetch(&self, model: String, key: ModelKey) -> SyncResult<Option<RemoteRecord>> {
        self.pace().await?;
        let mut state = self.state.lock();
        state.fetches += 1;
        Ok(state.records.get(&(model, key)).cloned())
    }

    async fn poll(
        &self,
        model: String,
        cursor: u64,
        limit: usize,
    ) -> SyncResult<Vec<RemoteChange>> {
        self.pace().await?;
        let state = self.state.lock();
        let start = usize::try_from(cursor).unwrap_or(usize::MAX);
        Ok(state
            .log
            .iter()
            .enumerate()
            .skip(start)
            .filter(|(_, (m, _))| *m == model)
            .take(limit)
            .map(|(i, (_, remote))| RemoteChange {
                remote: remote.clone(),
                cursor: i as u64 + 1,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(kind: MutationKind, expected_version: u64) -> RemoteMutation {
        RemoteMutation {
            model: "Comment".into(),
            key: ModelKey::from("c1"),
            kind,
            record: Record::new("Comment").with("id", "c1"),
            expected_version,
        }
    }

    #[tokio::test]
    async fn optimistic_versions() {
        let remote = MockRemote::new();
        assert_eq!(
            remote.create(mutation(MutationKind::Create, 0)).await.unwrap(),
            RemoteOutcome::Applied { version: 1 }
        );
        assert_eq!(
            remote.update(mutation(MutationKind::Update, 0)).await.unwrap(),
            RemoteOutcome::Conflict
        );
        assert_eq!(
            remote.update(mutation(MutationKind::Update, 1)).await.unwrap(),
            RemoteOutcome::Applied { version: 2 }
        );
        assert_eq!(remote.applied().len(), 2);
    }

    #[tokio::test]
    async fn injected_conflict_fires_once() {
        let remote = MockRemote::new();
        remote.inject_conflict("Comment", &ModelKey::from("c1"));
        assert_eq!(
            remote.create(mutation(MutationKind::Create, 0)).await.unwrap(),
            RemoteOutcome::Conflict
        );
        assert!(remote
            .create(mutation(MutationKind::Create, 0))
            .await
            .unwrap()
            .eq(&RemoteOutcome::Applied { version: 1 }));
    }

    #[tokio::test]
    async fn poll_resumes_from_cursor() {
        let remote = MockRemote::new();
        remote.remote_write(ModelKey::from("c1"), Record::new("Comment").with("id", "c1"));
        remote.remote_write(ModelKey::from("p1"), Record::new("Post").with("id", "p1"));
        remote.remote_write(ModelKey::from("c2"), Record::new("Comment").with("id", "c2"));

        let first = remote.poll("Comment".into(), 0, 1).await.unwrap();
        assert_eq!(first.len(), 1);
        let rest = remote
            .poll("Comment".into(), first[0].cursor, 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].cursor, 3);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let remote = MockRemote::new();
        remote.inject_failure(SyncError::Timeout);
        assert!(matches!(
            remote.fetch("Comment".into(), ModelKey::from("c1")).await,
            Err(SyncError::Timeout)
        ));
        assert!(remote
            .fetch("Comment".into(), ModelKey::from("c1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn abandoned_call_is_counted_out() {
        let remote = MockRemote::new();
        remote.set_latency(Duration::from_millis(200));
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            remote.create(mutation(MutationKind::Create, 0)),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(remote.applied().is_empty());

        remote.set_latency(Duration::ZERO);
        remote.create(mutation(MutationKind::Create, 0)).await.unwrap();
        assert_eq!(remote.max_in_flight_per_key(), 1);
    }
}
