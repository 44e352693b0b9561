//! Outbound draining, conflicts and retries against the mock remote.

use harbor_core::{MutationKind, MutationSource, RemoteRecord, StorageEngine};
use harbor_model::{ModelKey, Record};
use harbor_sync::{
    ConflictPolicy, ConflictWinner, MockRemote, Reconciler, RemoteChange, RemoteMutation,
    RemoteOutcome, RemoteService, RetryConfig, SyncConfig, SyncError, SyncEvent, SyncResult,
};
use harbor_testkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig::new(max_attempts)
        .with_initial_delay(Duration::from_millis(2))
        .with_max_delay(Duration::from_millis(10))
        .with_jitter(false)
}

fn setup(config: SyncConfig) -> (StorageEngine, Arc<MockRemote>, Reconciler<MockRemote>) {
    let engine = StorageEngine::in_memory(blog_registry()).unwrap();
    let remote = Arc::new(MockRemote::new());
    let reconciler = Reconciler::new(engine.clone(), Arc::clone(&remote), config).unwrap();
    (engine, remote, reconciler)
}

fn stored(engine: &StorageEngine, id: &str) -> Record {
    engine
        .query_by_id("Comment", &ModelKey::from(id))
        .unwrap()
        .expect("record is stored")
        .into_record()
}

fn received(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Pushes until the outbox is empty, waiting out backoff delays.
async fn drain<S: RemoteService>(engine: &StorageEngine, reconciler: &Reconciler<S>) {
    for _ in 0..200 {
        reconciler.push_pending().await;
        if engine.outbox().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("outbox did not drain: {:?}", engine.outbox().entries());
}

#[tokio::test]
async fn local_saves_reach_the_remote_and_are_acknowledged() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    let post = engine.save(post("p1", "hello"), None).unwrap().into_record();
    engine
        .save(comment("c1", "first", Some(&post)), None)
        .unwrap();
    let mut progress = reconciler.subscribe();

    assert_eq!(reconciler.push_pending().await, 2);

    assert!(engine.outbox().is_empty());
    assert_eq!(stored(&engine, "c1").version(), 1);
    let remote_comment = remote.record("Comment", &ModelKey::from("c1")).unwrap();
    assert_eq!(remote_comment.version, 1);
    assert_eq!(
        remote_comment.record.get("content").as_text(),
        Some("first")
    );
    let applied = received(&mut progress)
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::OutboundApplied { .. }))
        .count();
    assert_eq!(applied, 2);
    assert_eq!(reconciler.stats().acknowledged, 2);
}

#[tokio::test]
async fn updates_after_acknowledgement_carry_the_new_version() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    engine.save(comment("c1", "v1", None), None).unwrap();
    drain(&engine, &reconciler).await;

    engine.save(comment("c1", "v2", None), None).unwrap();
    assert_eq!(engine.outbox().entries()[0].event.version, 1);
    drain(&engine, &reconciler).await;

    let applied = remote.applied();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[1].kind, MutationKind::Update);
    assert_eq!(applied[1].expected_version, 1);
    assert_eq!(stored(&engine, "c1").version(), 2);
}

#[tokio::test]
async fn injected_conflict_overwrites_local_with_remote_truth() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    let key = ModelKey::from("c1");
    remote.remote_write(key.clone(), comment("c1", "original", None));
    assert_eq!(reconciler.pull("Comment").await.unwrap(), 1);

    // This process edits its copy of version 1 while another process has
    // already moved the remote to version 2.
    engine.save(comment("c1", "local edit", None), None).unwrap();
    remote.remote_write(key.clone(), comment("c1", "remote edit", None));
    remote.inject_conflict("Comment", &key);

    let events = engine.observe("Comment");
    let mut progress = reconciler.subscribe();
    reconciler.push_pending().await;

    let local = stored(&engine, "c1");
    assert_eq!(local.get("content").as_text(), Some("remote edit"));
    assert_eq!(local.version(), 2);
    assert!(engine.outbox().is_empty());
    assert!(remote.applied().is_empty());

    let published = events.drain();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].source, MutationSource::Remote);
    assert_eq!(
        published[0].record().unwrap().get("content").as_text(),
        Some("remote edit")
    );

    assert!(received(&mut progress).contains(&SyncEvent::ConflictResolved {
        model: "Comment".into(),
        key,
        winner: ConflictWinner::Remote,
    }));
    assert_eq!(reconciler.stats().conflicts, 1);
    assert_eq!(remote.fetch_count(), 1);
}

#[tokio::test]
async fn stale_expected_version_is_a_genuine_conflict() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    let key = ModelKey::from("c1");
    remote.remote_write(key.clone(), comment("c1", "original", None));
    reconciler.pull("Comment").await.unwrap();

    engine.save(comment("c1", "local edit", None), None).unwrap();
    remote.remote_write(key.clone(), comment("c1", "remote edit", None));
    reconciler.push_pending().await;

    assert_eq!(
        stored(&engine, "c1").get("content").as_text(),
        Some("remote edit")
    );
    assert_eq!(remote.record("Comment", &key).unwrap().version, 2);
    assert!(engine.outbox().is_empty());
}

#[tokio::test]
async fn local_wins_rebases_and_resends() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    reconciler.set_conflict_policy(ConflictPolicy::LocalWins);
    let key = ModelKey::from("c1");
    remote.remote_write(key.clone(), comment("c1", "original", None));
    reconciler.pull("Comment").await.unwrap();

    engine.save(comment("c1", "local edit", None), None).unwrap();
    remote.remote_write(key.clone(), comment("c1", "remote edit", None));
    let events = engine.observe("Comment");
    drain(&engine, &reconciler).await;

    let remote_state = remote.record("Comment", &key).unwrap();
    assert_eq!(remote_state.version, 3);
    assert_eq!(
        remote_state.record.get("content").as_text(),
        Some("local edit")
    );
    let local = stored(&engine, "c1");
    assert_eq!(local.get("content").as_text(), Some("local edit"));
    assert_eq!(local.version(), 3);
    // Acknowledgements do not change content and publish nothing.
    assert!(events.drain().is_empty());
}

#[tokio::test]
async fn conflict_without_remote_record_is_terminal() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    let key = ModelKey::from("c1");
    engine.save(comment("c1", "local", None), None).unwrap();
    remote.inject_conflict("Comment", &key);
    let mut progress = reconciler.subscribe();

    reconciler.push_pending().await;

    assert!(engine.outbox().is_empty());
    assert_eq!(reconciler.stats().terminal_failures, 1);
    assert!(received(&mut progress)
        .iter()
        .any(|e| matches!(e, SyncEvent::TerminalFailure { key: k, .. } if *k == key)));
    // The local record is kept.
    assert_eq!(stored(&engine, "c1").version(), 0);
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let (engine, remote, reconciler) = setup(SyncConfig::new().with_retry(fast_retry(5)));
    remote.inject_failure(SyncError::network_retryable("connection reset"));
    remote.inject_failure(SyncError::Unavailable("maintenance".into()));
    engine.save(comment("c1", "hello", None), None).unwrap();

    reconciler.push_pending().await;
    let entry = engine.outbox().entries().remove(0);
    assert_eq!(entry.retry_count, 1);
    assert!(!entry.in_flight);

    drain(&engine, &reconciler).await;
    let stats = reconciler.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.terminal_failures, 0);
    assert!(remote.record("Comment", &ModelKey::from("c1")).is_some());
}

/// Applies every mutation, but the first `losses` responses never arrive.
struct LossyRemote {
    inner: MockRemote,
    losses: AtomicUsize,
}

impl LossyRemote {
    fn new(losses: usize) -> Self {
        Self {
            inner: MockRemote::new(),
            losses: AtomicUsize::new(losses),
        }
    }

    fn deliver(&self, outcome: SyncResult<RemoteOutcome>) -> SyncResult<RemoteOutcome> {
        let outcome = outcome?;
        let lost = self
            .losses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(SyncError::network_retryable("response lost"));
        }
        Ok(outcome)
    }
}

impl RemoteService for LossyRemote {
    async fn create(&self, mutation: RemoteMutation) -> SyncResult<RemoteOutcome> {
        self.deliver(self.inner.create(mutation).await)
    }

    async fn update(&self, mutation: RemoteMutation) -> SyncResult<RemoteOutcome> {
        self.deliver(self.inner.update(mutation).await)
    }

    async fn delete(&self, mutation: RemoteMutation) -> SyncResult<RemoteOutcome> {
        self.deliver(self.inner.delete(mutation).await)
    }

    async fn fetch(&self, model: String, key: ModelKey) -> SyncResult<Option<RemoteRecord>> {
        self.inner.fetch(model, key).await
    }

    async fn poll(&self, model: String, cursor: u64, limit: usize) -> SyncResult<Vec<RemoteChange>> {
        self.inner.poll(model, cursor, limit).await
    }
}

#[tokio::test]
async fn delete_after_a_lost_create_response_reaches_the_remote() {
    let engine = StorageEngine::in_memory(blog_registry()).unwrap();
    let remote = Arc::new(LossyRemote::new(1));
    let reconciler = Reconciler::new(
        engine.clone(),
        Arc::clone(&remote),
        SyncConfig::new().with_retry(fast_retry(5)),
    )
    .unwrap();
    let key = ModelKey::from("c1");

    engine.save(comment("c1", "hello", None), None).unwrap();
    reconciler.push_pending().await;
    let entries = engine.outbox().entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].attempted);
    assert!(remote.inner.record("Comment", &key).is_some());

    // The create may have landed, so the delete must not cancel it.
    engine.delete_by_id("Comment", &key).unwrap();
    assert_eq!(engine.outbox().len(), 2);

    drain(&engine, &reconciler).await;
    let on_remote = remote.inner.record("Comment", &key).unwrap();
    assert!(on_remote.deleted);
    assert_eq!(on_remote.version, 2);
    let stats = reconciler.stats();
    assert_eq!(stats.conflicts, 0);
    assert_eq!(stats.terminal_failures, 0);

    reconciler.pull("Comment").await.unwrap();
    assert!(engine.query_by_id("Comment", &key).unwrap().is_none());
}

#[tokio::test]
async fn retried_update_whose_first_response_was_lost_is_acknowledged() {
    let engine = StorageEngine::in_memory(blog_registry()).unwrap();
    let remote = Arc::new(LossyRemote::new(0));
    let reconciler = Reconciler::new(
        engine.clone(),
        Arc::clone(&remote),
        SyncConfig::new().with_retry(fast_retry(5)),
    )
    .unwrap();
    engine.save(comment("c1", "v1", None), None).unwrap();
    drain(&engine, &reconciler).await;

    remote.losses.store(1, Ordering::SeqCst);
    engine.save(comment("c1", "v2", None), None).unwrap();
    drain(&engine, &reconciler).await;

    let local = stored(&engine, "c1");
    assert_eq!(local.get("content").as_text(), Some("v2"));
    assert_eq!(local.version(), 2);
    assert_eq!(reconciler.stats().conflicts, 0);
}

#[tokio::test]
async fn exhausted_retries_drop_the_mutation() {
    let (engine, remote, reconciler) = setup(SyncConfig::new().with_retry(fast_retry(3)));
    for _ in 0..3 {
        remote.inject_failure(SyncError::network_retryable("connection reset"));
    }
    engine.save(comment("c1", "hello", None), None).unwrap();
    let mut progress = reconciler.subscribe();

    drain(&engine, &reconciler).await;

    let stats = reconciler.stats();
    assert_eq!(stats.sends, 3);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.terminal_failures, 1);
    assert!(stats.last_error.is_some());
    assert!(remote.record("Comment", &ModelKey::from("c1")).is_none());
    assert!(received(&mut progress)
        .iter()
        .any(|e| matches!(e, SyncEvent::TerminalFailure { .. })));
}

#[tokio::test]
async fn permanent_rejection_is_not_retried() {
    let (engine, remote, reconciler) = setup(SyncConfig::new().with_retry(fast_retry(5)));
    remote.inject_failure(SyncError::Rejected("payload too large".into()));
    engine.save(comment("c1", "hello", None), None).unwrap();

    reconciler.push_pending().await;

    assert!(engine.outbox().is_empty());
    let stats = reconciler.stats();
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.terminal_failures, 1);
}

#[tokio::test]
async fn timeouts_count_as_transient_failures() {
    let config = SyncConfig::new()
        .with_send_timeout(Duration::from_millis(20))
        .with_retry(fast_retry(3));
    let (engine, remote, reconciler) = setup(config);
    remote.set_latency(Duration::from_millis(200));
    engine.save(comment("c1", "hello", None), None).unwrap();

    reconciler.push_pending().await;
    assert_eq!(engine.outbox().entries()[0].retry_count, 1);
    assert!(remote.applied().is_empty());

    remote.set_latency(Duration::ZERO);
    drain(&engine, &reconciler).await;
    assert_eq!(remote.applied().len(), 1);
    assert_eq!(stored(&engine, "c1").version(), 1);
}

#[tokio::test]
async fn deletes_are_sent_with_the_last_acknowledged_version() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    let key = ModelKey::from("c1");
    engine.save(comment("c1", "hello", None), None).unwrap();
    drain(&engine, &reconciler).await;

    engine.delete_by_id("Comment", &key).unwrap();
    drain(&engine, &reconciler).await;

    let remote_state = remote.record("Comment", &key).unwrap();
    assert!(remote_state.deleted);
    assert_eq!(remote_state.version, 2);
    assert_eq!(remote.applied()[1].kind, MutationKind::Delete);
    assert_eq!(remote.applied()[1].expected_version, 1);
}

#[tokio::test]
async fn local_only_models_are_never_sent() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    engine
        .save(Record::new("Note").with("id", "n1").with("body", "private"), None)
        .unwrap();

    assert_eq!(reconciler.push_pending().await, 0);
    assert!(remote.applied().is_empty());
}

#[tokio::test]
async fn unmanaged_models_stay_queued() {
    let (engine, remote, reconciler) =
        setup(SyncConfig::new().with_models(["Comment"]));
    engine.save(post("p1", "hello"), None).unwrap();
    engine.save(comment("c1", "hello", None), None).unwrap();

    assert_eq!(reconciler.push_pending().await, 1);
    assert_eq!(remote.applied().len(), 1);
    assert_eq!(engine.outbox().len(), 1);
    assert_eq!(engine.outbox().entries()[0].event.model, "Post");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_send_in_flight_per_key_and_commit_order_per_key() {
    let config = SyncConfig::new()
        .with_max_concurrent_sends(4)
        .with_poll_interval(Duration::from_millis(20));
    let (engine, remote, reconciler) = setup(config);
    remote.set_latency(Duration::from_millis(15));
    reconciler.start().unwrap();

    for round in 0..4 {
        for id in ["c1", "c2", "c3"] {
            engine
                .save(comment(id, &format!("{id} rev {round}"), None), None)
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for _ in 0..400 {
        if engine.outbox().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    reconciler.stop().await;

    assert!(engine.outbox().is_empty());
    assert!(remote.max_in_flight_per_key() <= 1);
    for id in ["c1", "c2", "c3"] {
        let key = ModelKey::from(id);
        let sent: Vec<_> = remote
            .applied()
            .into_iter()
            .filter(|m| m.key == key)
            .collect();
        assert_eq!(sent[0].kind, MutationKind::Create);
        // Expected versions follow the remote's version sequence.
        for (i, mutation) in sent.iter().enumerate() {
            assert_eq!(mutation.expected_version, i as u64);
        }
        let last = remote.record("Comment", &key).unwrap();
        let expected = format!("{id} rev 3");
        assert_eq!(last.record.get("content").as_text(), Some(expected.as_str()));
        assert_eq!(stored(&engine, id).version(), last.version);
    }
}
