//! Starting, stopping and background operation of the reconciler.

use harbor_core::{CoreError, StorageEngine};
use harbor_model::ModelKey;
use harbor_sync::{
    ConflictPolicy, MockRemote, ModelState, Reconciler, SyncConfig, SyncError, SyncEvent,
};
use harbor_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn setup(config: SyncConfig) -> (StorageEngine, Arc<MockRemote>, Reconciler<MockRemote>) {
    let engine = StorageEngine::in_memory(blog_registry()).unwrap();
    let remote = Arc::new(MockRemote::new());
    let reconciler = Reconciler::new(engine.clone(), Arc::clone(&remote), config).unwrap();
    (engine, remote, reconciler)
}

fn quick() -> SyncConfig {
    SyncConfig::new().with_poll_interval(Duration::from_millis(10))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[test]
fn manages_every_replicated_model_by_default() {
    let (_, _, reconciler) = setup(SyncConfig::new());
    let mut models = reconciler.models().to_vec();
    models.sort();
    assert_eq!(models, ["Comment", "Post"]);
    assert_eq!(reconciler.state("Post"), ModelState::Stopped);
    assert!(matches!(reconciler.conflict_policy(), ConflictPolicy::RemoteWins));
}

#[test]
fn rejects_local_only_and_unknown_models() {
    let engine = StorageEngine::in_memory(blog_registry()).unwrap();
    let remote = Arc::new(MockRemote::new());

    let local_only = Reconciler::new(
        engine.clone(),
        Arc::clone(&remote),
        SyncConfig::new().with_models(["Note"]),
    );
    assert!(matches!(
        local_only,
        Err(SyncError::Engine(CoreError::Configuration { .. }))
    ));

    let unknown = Reconciler::new(engine, remote, SyncConfig::new().with_models(["Nope"]));
    assert!(matches!(unknown, Err(SyncError::Engine(CoreError::Model(_)))));
}

#[test]
fn start_requires_a_runtime() {
    let (_, _, reconciler) = setup(SyncConfig::new());
    assert!(matches!(reconciler.start(), Err(SyncError::NoRuntime(_))));
    assert!(!reconciler.is_running());
}

#[tokio::test]
async fn start_and_stop_move_through_states() {
    let (engine, remote, reconciler) = setup(quick().with_models(["Comment"]));
    remote.remote_write(ModelKey::from("c1"), comment("c1", "remote", None));
    let mut progress = reconciler.subscribe();

    reconciler.start().unwrap();
    assert!(reconciler.is_running());
    assert_eq!(reconciler.state("Comment"), ModelState::Starting);
    assert!(matches!(
        reconciler.start(),
        Err(SyncError::InvalidStateTransition { .. })
    ));

    eventually(|| reconciler.state("Comment") == ModelState::Syncing).await;
    assert!(engine.is_model_synced("Comment"));
    assert_eq!(engine.count("Comment", None).unwrap(), 1);

    reconciler.stop().await;
    assert!(!reconciler.is_running());
    assert_eq!(reconciler.state("Comment"), ModelState::Stopped);

    let mut seen = Vec::new();
    while let Ok(event) = progress.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SyncEvent::ModelSynced {
        model: "Comment".into()
    }));
    let states: Vec<ModelState> = seen
        .iter()
        .filter_map(|e| match e {
            SyncEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        [ModelState::Starting, ModelState::Syncing, ModelState::Stopped]
    );
}

#[tokio::test]
async fn restarts_after_stop() {
    let (_, _, reconciler) = setup(quick());
    reconciler.start().unwrap();
    reconciler.stop().await;
    reconciler.start().unwrap();
    assert!(reconciler.is_running());
    reconciler.stop().await;
}

#[tokio::test]
async fn background_task_pushes_local_saves() {
    let (engine, remote, reconciler) = setup(quick());
    reconciler.start().unwrap();

    engine.save(comment("c1", "hello", None), None).unwrap();
    eventually(|| engine.outbox().is_empty()).await;

    let stored = remote.record("Comment", &ModelKey::from("c1")).unwrap();
    assert_eq!(stored.version, 1);
    reconciler.stop().await;
}

#[tokio::test]
async fn failed_inbound_sync_parks_the_model_in_error() {
    let (engine, remote, reconciler) = setup(quick().with_models(["Comment"]));
    remote.inject_failure(SyncError::Rejected("unknown model".into()));

    reconciler.start().unwrap();
    eventually(|| reconciler.state("Comment") == ModelState::Error).await;
    assert!(!engine.is_model_synced("Comment"));
    assert!(reconciler.stats().last_error.is_some());

    // Mutations for an errored model wait for a restart.
    engine.save(comment("c1", "hello", None), None).unwrap();
    assert_eq!(reconciler.push_pending().await, 0);
    assert_eq!(engine.outbox().len(), 1);

    reconciler.stop().await;
    reconciler.start().unwrap();
    eventually(|| engine.outbox().is_empty()).await;
    reconciler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lazy_reference_falls_back_to_the_remote() {
    let (engine, remote, reconciler) = setup(SyncConfig::new());
    let remote_post = post("p9", "remote");
    remote.remote_write(post_key("p9", "remote"), remote_post.clone());
    reconciler.install_remote_fetch().unwrap();

    engine
        .save(comment("c1", "orphan", Some(&remote_post)), None)
        .unwrap();
    let loaded = engine
        .query_by_id("Comment", &ModelKey::from("c1"))
        .unwrap()
        .unwrap();

    let resolved = tokio::task::spawn_blocking(move || loaded.reference("post").unwrap().require())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.version(), 1);
    assert_eq!(remote.fetch_count(), 1);
    assert_eq!(engine.count("Post", None).unwrap(), 1);
}
