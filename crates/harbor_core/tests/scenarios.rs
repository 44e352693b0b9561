//! End-to-end engine scenarios over the blog schema.

use harbor_core::{CoreError, MutationKind, ReferenceState};
use harbor_model::{field, KeyValue, ModelKey};
use harbor_testkit::prelude::*;

#[test]
fn reference_resolves_on_first_access() {
    with_engine(|engine| {
        let saved_post = engine.save(post("p1", "title"), None).unwrap();
        engine
            .save(comment("c1", "content", Some(saved_post.record())), None)
            .unwrap();

        let comment = engine
            .query_by_id("Comment", &ModelKey::from("c1"))
            .unwrap()
            .unwrap();
        let reference = comment.reference("post").unwrap();
        match reference.state() {
            ReferenceState::NotLoaded {
                identifiers: Some(ids),
            } => {
                assert_eq!(ids.len(), 2);
                assert_eq!(ids[0].name, "id");
                assert_eq!(ids[0].value, KeyValue::from("p1"));
                assert_eq!(ids[1].name, "title");
                assert_eq!(ids[1].value, KeyValue::from("title"));
            }
            other => panic!("unexpected state {other:?}"),
        }

        let resolved = reference.get().unwrap().unwrap();
        assert_eq!(resolved.get("id").as_text(), Some("p1"));
        assert!(matches!(reference.state(), ReferenceState::Loaded(_)));
    });
}

#[test]
fn reference_absent_then_assigned() {
    with_engine(|engine| {
        let saved_post = engine.save(post("p1", "title"), None).unwrap();
        engine.save(comment("c1", "content", None), None).unwrap();

        let mut loaded = engine
            .query_by_id("Comment", &ModelKey::from("c1"))
            .unwrap()
            .unwrap();
        assert_eq!(
            loaded.reference("post").unwrap().state(),
            ReferenceState::NotLoaded { identifiers: None }
        );
        assert_eq!(loaded.reference("post").unwrap().get().unwrap(), None);

        loaded
            .set_reference("post", Some(saved_post.record()))
            .unwrap();
        engine.save(loaded, None).unwrap();

        let requeried = engine
            .query_by_id("Comment", &ModelKey::from("c1"))
            .unwrap()
            .unwrap();
        let reference = requeried.reference("post").unwrap();
        assert_eq!(reference.target_key(), Some(post_key("p1", "title")));
        assert!(!reference.is_loaded());
    });
}

#[test]
fn reference_follows_reassignment() {
    with_engine(|engine| {
        let first = engine.save(post("p1", "first"), None).unwrap();
        let second = engine.save(post("p2", "second"), None).unwrap();
        engine
            .save(comment("c1", "content", Some(first.record())), None)
            .unwrap();

        let mut loaded = engine
            .query_by_id("Comment", &ModelKey::from("c1"))
            .unwrap()
            .unwrap();
        loaded.set_reference("post", Some(second.record())).unwrap();
        engine.save(loaded, None).unwrap();

        let requeried = engine
            .query_by_id("Comment", &ModelKey::from("c1"))
            .unwrap()
            .unwrap();
        let resolved = requeried.reference("post").unwrap().require().unwrap();
        assert_eq!(resolved.get("id").as_text(), Some("p2"));
        assert_eq!(resolved.get("title").as_text(), Some("second"));
    });
}

#[test]
fn cascading_delete_removes_children() {
    with_engine(|engine| {
        let saved_post = engine.save(post("p1", "title"), None).unwrap();
        engine
            .save(comment("c1", "content", Some(saved_post.record())), None)
            .unwrap();
        engine.save(comment("c2", "unrelated", None), None).unwrap();

        let deleted = engine.delete_by_id("Post", &post_key("p1", "title")).unwrap();
        assert_eq!(deleted, 2);

        assert!(engine
            .query_by_id("Post", &post_key("p1", "title"))
            .unwrap()
            .is_none());
        assert!(engine
            .query_by_id("Comment", &ModelKey::from("c1"))
            .unwrap()
            .is_none());
        assert!(engine
            .query_by_id("Comment", &ModelKey::from("c2"))
            .unwrap()
            .is_some());
    });
}

#[test]
fn cascade_publishes_children_before_parent() {
    with_engine(|engine| {
        let saved_post = engine.save(post("p1", "title"), None).unwrap();
        engine
            .save(comment("c1", "content", Some(saved_post.record())), None)
            .unwrap();
        let events = engine.observe_all();

        engine.delete(saved_post.record()).unwrap();

        let published = events.drain();
        let order: Vec<(&str, MutationKind)> = published
            .iter()
            .map(|e| (e.model.as_str(), e.kind))
            .collect();
        assert_eq!(
            order,
            [
                ("Comment", MutationKind::Delete),
                ("Post", MutationKind::Delete)
            ]
        );
    });
}

#[test]
fn delete_missing_record_is_not_found() {
    with_engine(|engine| {
        let err = engine
            .delete_by_id("Post", &post_key("nope", "x"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    });
}

#[test]
fn delete_where_counts_every_deleted_record() {
    with_engine(|engine| {
        for (id, rating) in [("p1", 1), ("p2", 5), ("p3", 9)] {
            engine
                .save(post(id, "t").with("rating", rating), None)
                .unwrap();
        }
        let removed = engine
            .delete_where("Post", &field("rating").ge(5))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(engine.count("Post", None).unwrap(), 1);
    });
}

#[test]
fn save_reports_create_then_update() {
    with_engine(|engine| {
        let events = engine.observe("Post");
        engine.save(post("p1", "t"), None).unwrap();
        engine.save(post("p1", "t").with("rating", 3), None).unwrap();

        let kinds: Vec<MutationKind> = events.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [MutationKind::Create, MutationKind::Update]);
        assert_eq!(engine.count("Post", None).unwrap(), 1);
    });
}

#[test]
fn conditional_save() {
    with_engine(|engine| {
        let err = engine
            .save(post("p1", "t"), Some(&field("rating").eq(1)))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));

        engine.save(post("p1", "t").with("rating", 1), None).unwrap();
        let err = engine
            .save(
                post("p1", "t").with("rating", 2),
                Some(&field("rating").eq(5)),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::ConditionFailed { .. }));

        engine
            .save(
                post("p1", "t").with("rating", 2),
                Some(&field("rating").eq(1)),
            )
            .unwrap();
        let stored = engine
            .query_by_id("Post", &post_key("p1", "t"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("rating").as_integer(), Some(2));
    });
}

#[test]
fn unknown_model_is_rejected() {
    with_engine(|engine| {
        assert!(matches!(
            engine.query("Ghost", None).unwrap_err(),
            CoreError::Model(_)
        ));
    });
}

#[test]
fn local_only_models_skip_the_outbox() {
    with_engine(|engine| {
        engine
            .save(
                harbor_model::Record::new("Note")
                    .with("id", "n1")
                    .with("body", "private"),
                None,
            )
            .unwrap();
        assert!(engine.outbox().is_empty());
        assert_eq!(engine.count("Note", None).unwrap(), 1);
    });
}

#[test]
fn closed_adapter_is_a_configuration_error() {
    with_engine(|engine| {
        engine.adapter().close();
        let err = engine.save(post("p1", "t"), None).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    });
}

#[test]
fn oversized_payload_writes_nothing() {
    let registry = blog_registry();
    let engine = harbor_core::StorageEngine::open(
        registry,
        std::sync::Arc::new(harbor_storage::MemoryStore::in_memory()),
        harbor_core::EngineConfig::default().with_max_payload_bytes(16),
    )
    .unwrap();

    let err = engine
        .save(post("p1", "a title long enough to exceed the limit"), None)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    assert_eq!(engine.count("Post", None).unwrap(), 0);
    assert!(engine.outbox().is_empty());
}

#[test]
fn outbox_survives_reopen() {
    let test = TestEngine::file();
    test.save(post("p1", "t"), None).unwrap();
    test.save(comment("c1", "x", None), None).unwrap();
    let test = test.reopen();

    let entries = test.outbox().entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| !e.in_flight));
    assert_eq!(entries[0].event.model, "Post");
}

#[test]
fn clear_drops_records_and_outbox() {
    with_engine(|engine| {
        engine.save(post("p1", "t"), None).unwrap();
        engine.mark_model_synced("Post");
        engine.clear().unwrap();

        assert_eq!(engine.count("Post", None).unwrap(), 0);
        assert!(engine.outbox().is_empty());
        assert!(!engine.is_model_synced("Post"));
    });
}
