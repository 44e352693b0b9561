//! Test fixtures and engine helpers.
//!
//! The blog schema used throughout the tests:
//!
//! - `Post`: composite key `(id, title)`, cascading `comments`
//! - `Comment`: key `id`, optional `post` reference stored in
//!   `postID` + `postTitle`
//! - `Note`: local-only, never replicated

use harbor_core::{EngineConfig, StorageEngine};
use harbor_model::{ModelKey, ModelRegistry, ModelSchema, Record, ValueType};
use harbor_storage::{AdapterConfig, FileStore, MemoryStore, StorageAdapter};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Builds the blog registry.
pub fn blog_registry() -> Arc<ModelRegistry> {
    ModelRegistry::builder()
        .register(
            ModelSchema::builder("Post")
                .field("id", ValueType::Id)
                .field("title", ValueType::Text)
                .optional("rating", ValueType::Integer)
                .primary_key(&["id", "title"])
                .has_many("comments", "Comment", &["postID", "postTitle"])
                .build()
                .expect("Post schema"),
        )
        .register(
            ModelSchema::builder("Comment")
                .field("id", ValueType::Id)
                .field("content", ValueType::Text)
                .optional("postID", ValueType::Id)
                .optional("postTitle", ValueType::Text)
                .belongs_to("post", "Post", &["postID", "postTitle"])
                .build()
                .expect("Comment schema"),
        )
        .register(
            ModelSchema::builder("Note")
                .field("id", ValueType::Id)
                .field("body", ValueType::Text)
                .local_only()
                .build()
                .expect("Note schema"),
        )
        .build()
        .expect("blog registry")
}

/// A new `Post` record.
pub fn post(id: &str, title: &str) -> Record {
    Record::new("Post").with("id", id).with("title", title)
}

/// The composite key of a `Post`.
pub fn post_key(id: &str, title: &str) -> ModelKey {
    ModelKey::new(vec![id.into(), title.into()])
}

/// A new `Comment` record, attached to `post` if given.
pub fn comment(id: &str, content: &str, post: Option<&Record>) -> Record {
    let mut record = Record::new("Comment").with("id", id).with("content", content);
    if let Some(post) = post {
        record.set("postID", post.get("id").clone());
        record.set("postTitle", post.get("title").clone());
    }
    record
}

/// A test engine with automatic cleanup.
pub struct TestEngine {
    /// The engine.
    pub engine: StorageEngine,
    /// The store directory, if file-backed.
    temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// An engine over the blog schema in memory.
    pub fn memory() -> Self {
        Self {
            engine: StorageEngine::in_memory(blog_registry()).expect("in-memory engine"),
            temp_dir: None,
        }
    }

    /// An engine over the blog schema in a temporary store directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let engine = open_file_engine(temp_dir.path());
        Self {
            engine,
            temp_dir: Some(temp_dir),
        }
    }

    /// Closes the engine and reopens it over the same directory.
    ///
    /// Panics for in-memory engines.
    pub fn reopen(self) -> Self {
        let temp_dir = self.temp_dir.expect("only file engines can be reopened");
        self.engine.adapter().close();
        drop(self.engine);
        let engine = open_file_engine(temp_dir.path());
        Self {
            engine,
            temp_dir: Some(temp_dir),
        }
    }

    /// Store directory, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }
}

impl std::ops::Deref for TestEngine {
    type Target = StorageEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

fn open_file_engine(path: &Path) -> StorageEngine {
    let store: Arc<dyn StorageAdapter> = Arc::new(
        FileStore::open_dir(path, AdapterConfig::default()).expect("Failed to open store"),
    );
    StorageEngine::open(blog_registry(), store, EngineConfig::default())
        .expect("Failed to open engine")
}

/// Runs `f` with a fresh in-memory blog engine.
pub fn with_engine<F, R>(f: F) -> R
where
    F: FnOnce(&StorageEngine) -> R,
{
    let test = TestEngine::memory();
    f(&test.engine)
}

/// An in-memory adapter shared with the caller, for inspecting raw state.
pub fn shared_memory_engine() -> (Arc<MemoryStore>, StorageEngine) {
    let store = Arc::new(MemoryStore::in_memory());
    let adapter: Arc<dyn StorageAdapter> = Arc::clone(&store) as Arc<dyn StorageAdapter>;
    let engine = StorageEngine::open(blog_registry(), adapter, EngineConfig::default())
        .expect("Failed to open engine");
    (store, engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blog_schema_is_consistent() {
        let registry = blog_registry();
        assert_eq!(registry.get("Post").unwrap().primary_key(), ["id", "title"]);
        assert!(!registry.get("Note").unwrap().sync_enabled());
    }

    #[test]
    fn comment_copies_post_key() {
        let p = post("p1", "hello");
        let c = comment("c1", "nice", Some(&p));
        let schema = blog_registry();
        let fk = c
            .key_from_fields(schema.get("Comment").unwrap().association("post").unwrap().key_fields())
            .unwrap();
        assert_eq!(fk, post_key("p1", "hello"));
    }

    #[test]
    fn file_engine_reopens() {
        let test = TestEngine::file();
        test.save(post("p1", "hello"), None).unwrap();
        let test = test.reopen();
        assert_eq!(test.count("Post", None).unwrap(), 1);
        assert_eq!(test.outbox().len(), 1);
    }

    #[test]
    fn shared_store_sees_engine_writes() {
        let (store, engine) = shared_memory_engine();
        engine.save(post("p1", "hello"), None).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.records.get("Post"), Some(&1));
        assert!(stats.frames >= 1);
    }
}
