//! Lazy list and reference invalidation.

use harbor_core::{
    CoreError, CoreResult, ListState, RemoteFetch, RemoteRecord, StorageEngine,
};
use harbor_model::{ModelKey, Record};
use harbor_storage::{AdapterConfig, MemoryStore, StorageAdapter};
use harbor_testkit::prelude::*;
use std::sync::Arc;

fn engine_with_post() -> (StorageEngine, Record) {
    let engine = StorageEngine::in_memory(blog_registry()).unwrap();
    let saved = engine.save(post("p1", "title"), None).unwrap();
    (engine, saved.into_record())
}

#[test]
fn list_fetch_is_cached_until_a_child_changes() {
    let (engine, parent) = engine_with_post();
    engine
        .save(comment("c1", "one", Some(&parent)), None)
        .unwrap();
    engine
        .save(comment("c2", "two", Some(&parent)), None)
        .unwrap();

    let loaded = engine
        .query_by_id("Post", &post_key("p1", "title"))
        .unwrap()
        .unwrap();
    let comments = loaded.list("comments").unwrap();
    assert!(matches!(comments.state(), ListState::NotLoaded { .. }));
    assert_eq!(comments.fetch().unwrap().len(), 2);
    assert_eq!(comments.count(), Some(2));

    engine
        .save(comment("c3", "three", Some(&parent)), None)
        .unwrap();
    assert!(!comments.is_loaded());
    assert_eq!(comments.fetch().unwrap().len(), 3);

    engine.delete_by_id("Comment", &ModelKey::from("c1")).unwrap();
    assert!(!comments.is_loaded());
    assert_eq!(comments.fetch().unwrap().len(), 2);
}

#[test]
fn unrelated_changes_keep_the_list_loaded() {
    let (engine, parent) = engine_with_post();
    let other = engine.save(post("p2", "other"), None).unwrap();
    engine
        .save(comment("c1", "one", Some(&parent)), None)
        .unwrap();

    let loaded = engine
        .query_by_id("Post", &post_key("p1", "title"))
        .unwrap()
        .unwrap();
    let comments = loaded.list("comments").unwrap();
    comments.fetch().unwrap();

    engine
        .save(comment("c9", "elsewhere", Some(other.record())), None)
        .unwrap();
    assert!(comments.is_loaded());
}

#[test]
fn moving_a_child_away_invalidates_the_old_parent() {
    let (engine, parent) = engine_with_post();
    let other = engine.save(post("p2", "other"), None).unwrap();
    engine
        .save(comment("c1", "one", Some(&parent)), None)
        .unwrap();

    let loaded = engine
        .query_by_id("Post", &post_key("p1", "title"))
        .unwrap()
        .unwrap();
    let comments = loaded.list("comments").unwrap();
    assert_eq!(comments.fetch().unwrap().len(), 1);

    engine
        .save(comment("c1", "one", Some(other.record())), None)
        .unwrap();
    assert_eq!(comments.fetch().unwrap().len(), 0);
}

#[test]
fn explicit_invalidate_forces_refetch() {
    let (engine, _) = engine_with_post();
    let loaded = engine
        .query_by_id("Post", &post_key("p1", "title"))
        .unwrap()
        .unwrap();
    let comments = loaded.list("comments").unwrap();
    comments.fetch().unwrap();
    assert!(comments.is_loaded());
    comments.invalidate();
    assert!(!comments.is_loaded());
}

#[test]
fn reference_reloads_after_target_update() {
    let (engine, parent) = engine_with_post();
    engine
        .save(comment("c1", "one", Some(&parent)), None)
        .unwrap();
    let loaded = engine
        .query_by_id("Comment", &ModelKey::from("c1"))
        .unwrap()
        .unwrap();
    let reference = loaded.reference("post").unwrap();
    assert_eq!(reference.require().unwrap().get("rating").as_integer(), None);

    engine
        .save(post("p1", "title").with("rating", 7), None)
        .unwrap();
    assert!(!reference.is_loaded());
    assert_eq!(
        reference.require().unwrap().get("rating").as_integer(),
        Some(7)
    );
}

#[test]
fn clear_resets_loaded_proxies() {
    let (engine, parent) = engine_with_post();
    engine
        .save(comment("c1", "one", Some(&parent)), None)
        .unwrap();
    let loaded = engine
        .query_by_id("Post", &post_key("p1", "title"))
        .unwrap()
        .unwrap();
    let comments = loaded.list("comments").unwrap();
    comments.fetch().unwrap();

    engine.clear().unwrap();
    assert!(!comments.is_loaded());
    assert!(matches!(
        comments.fetch().unwrap_err(),
        CoreError::NotFound { .. }
    ));
}

#[test]
fn dropped_engine_is_a_configuration_error() {
    let (engine, _) = engine_with_post();
    let loaded = engine
        .query_by_id("Post", &post_key("p1", "title"))
        .unwrap()
        .unwrap();
    drop(engine);
    assert!(matches!(
        loaded.list("comments").unwrap().fetch().unwrap_err(),
        CoreError::Configuration { .. }
    ));
}

#[test]
fn foreign_thread_on_confined_store_is_rejected() {
    let store: Arc<dyn StorageAdapter> = Arc::new(
        MemoryStore::open(
            harbor_storage::MemoryLog::new(),
            AdapterConfig::default().with_thread_confined(true),
        )
        .unwrap(),
    );
    let engine =
        StorageEngine::open(blog_registry(), store, harbor_core::EngineConfig::default())
            .unwrap();
    engine.save(post("p1", "title"), None).unwrap();
    let loaded = engine
        .query_by_id("Post", &post_key("p1", "title"))
        .unwrap()
        .unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            let err = loaded.list("comments").unwrap().fetch().unwrap_err();
            assert!(matches!(err, CoreError::InvalidOperation { .. }));
        });
    });
}

struct StaticRemote(Record);

impl RemoteFetch for StaticRemote {
    fn fetch(&self, model: &str, key: &ModelKey) -> CoreResult<Option<RemoteRecord>> {
        if model == "Post" && *key == post_key("p9", "remote") {
            Ok(Some(RemoteRecord::present(self.0.clone(), 4)))
        } else {
            Ok(None)
        }
    }
}

#[test]
fn missing_target_falls_back_to_remote_fetch() {
    let engine = StorageEngine::in_memory(blog_registry()).unwrap();
    let remote_post = post("p9", "remote");
    engine.set_remote_fetch(Arc::new(StaticRemote(remote_post.clone())));
    engine
        .save(comment("c1", "orphan", Some(&remote_post)), None)
        .unwrap();

    let loaded = engine
        .query_by_id("Comment", &ModelKey::from("c1"))
        .unwrap()
        .unwrap();
    let resolved = loaded.reference("post").unwrap().require().unwrap();
    assert_eq!(resolved.version(), 4);
    assert_eq!(engine.count("Post", None).unwrap(), 1);
    // Fetched records are remote state, not local mutations.
    assert_eq!(engine.outbox().len(), 1);
}
