//! Lazy relationship proxies.
//!
//! A loaded [`Model`](crate::Model) never holds its related records. It
//! holds a [`LazyReference`] per belongs-to association and a [`LazyList`]
//! per has-many association. Each proxy keeps only key tuples plus a weak
//! handle to the engine, and resolves against local storage on access.
//!
//! Resolved values are cached. A cache entry is stale once a mutation event
//! touches any record it depends on; the next access re-queries.

use crate::engine::{EngineInner, StorageEngine};
use crate::error::{CoreError, CoreResult};
use crate::invalidation::{LoadMark, Slot};
use harbor_model::{KeyValue, ModelKey, ModelSchema, Predicate, Record};
use harbor_storage::QueryOptions;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::trace;

/// One named component of a related record's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    /// Field name on the target model.
    pub name: String,
    /// Component value.
    pub value: KeyValue,
}

/// Resolution state of a [`LazyReference`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceState {
    /// Not resolved yet. `identifiers` is `None` when the relationship is
    /// absent, as opposed to merely unresolved.
    NotLoaded {
        /// Key of the target record.
        identifiers: Option<Vec<Identifier>>,
    },
    /// Resolved to the target record.
    Loaded(Record),
}

/// Resolution state of a [`LazyList`].
#[derive(Debug, Clone, PartialEq)]
pub enum ListState {
    /// Not fetched, or invalidated since the last fetch.
    NotLoaded {
        /// Parent key the child foreign-key fields must equal.
        associated_ids: ModelKey,
        /// Child foreign-key field names.
        associated_fields: Vec<String>,
    },
    /// Fetched and still current.
    Loaded {
        /// Child records in primary-key order.
        items: Vec<Record>,
        /// Number of items.
        count: usize,
    },
}

/// Non-owning link from a proxy back to its owner and engine.
#[derive(Clone)]
struct Owner {
    engine: Weak<EngineInner>,
    model: String,
    key: ModelKey,
}

impl Owner {
    fn engine(&self) -> CoreResult<StorageEngine> {
        self.engine
            .upgrade()
            .map(StorageEngine::from_inner)
            .ok_or_else(|| CoreError::configuration("storage engine has been dropped"))
    }

    fn slot(&self) -> Slot {
        Slot::Record {
            model: self.model.clone(),
            key: self.key.clone(),
        }
    }

    fn ensure_present(&self, engine: &StorageEngine) -> CoreResult<()> {
        if !engine.adapter().exists(&self.model, &self.key)? {
            return Err(CoreError::not_found(&self.model, &self.key));
        }
        Ok(())
    }
}

/// A belongs-to relationship resolved on first access.
pub struct LazyReference {
    owner: Owner,
    target: Arc<ModelSchema>,
    identifiers: Option<Vec<Identifier>>,
    cache: Mutex<Option<(Option<Record>, LoadMark)>>,
}

impl LazyReference {
    pub(crate) fn new(
        engine: Weak<EngineInner>,
        owner_model: &str,
        owner_key: ModelKey,
        target: Arc<ModelSchema>,
        identifiers: Option<Vec<Identifier>>,
    ) -> Self {
        Self {
            owner: Owner {
                engine,
                model: owner_model.to_string(),
                key: owner_key,
            },
            target,
            identifiers,
            cache: Mutex::new(None),
        }
    }

    /// Target model name.
    pub fn target_model(&self) -> &str {
        self.target.name()
    }

    /// Key components of the target, or `None` if the relationship is absent.
    pub fn identifiers(&self) -> Option<&[Identifier]> {
        self.identifiers.as_deref()
    }

    /// Target primary key, or `None` if the relationship is absent.
    pub fn target_key(&self) -> Option<ModelKey> {
        self.identifiers.as_ref().map(|ids| {
            ModelKey::new(ids.iter().map(|id| id.value.clone()).collect())
        })
    }

    fn slots(&self, key: ModelKey) -> [Slot; 2] {
        [
            Slot::Record {
                model: self.target.name().to_string(),
                key,
            },
            self.owner.slot(),
        ]
    }

    fn cached(&self, engine: &StorageEngine) -> Option<Option<Record>> {
        let key = self.target_key()?;
        let cache = self.cache.lock();
        let (record, mark) = cache.as_ref()?;
        if engine.tracker().changed_since(mark.loaded_at(), &self.slots(key)) {
            return None;
        }
        Some(record.clone())
    }

    /// Current state without triggering a load.
    pub fn state(&self) -> ReferenceState {
        let loaded = self
            .owner
            .engine()
            .ok()
            .and_then(|engine| self.cached(&engine))
            .flatten();
        match loaded {
            Some(record) => ReferenceState::Loaded(record),
            None => ReferenceState::NotLoaded {
                identifiers: self.identifiers.clone(),
            },
        }
    }

    /// True if a resolved target is cached and current.
    pub fn is_loaded(&self) -> bool {
        matches!(self.state(), ReferenceState::Loaded(_))
    }

    /// Resolves the target.
    ///
    /// Returns `None` when the relationship is absent, or when the target is
    /// neither stored locally nor known to the remote fetch hook.
    pub fn get(&self) -> CoreResult<Option<Record>> {
        let Some(key) = self.target_key() else {
            return Ok(None);
        };
        let engine = self.owner.engine()?;
        engine.check_access()?;
        if let Some(hit) = self.cached(&engine) {
            return Ok(hit);
        }

        let mark = engine.tracker().mark();
        self.owner.ensure_present(&engine)?;
        let mut record = engine.find_by_key(&self.target, &key)?;
        if record.is_none() {
            record = engine.fetch_remote(&self.target, &key)?;
        }
        trace!(
            model = %self.target.name(),
            key = %key,
            found = record.is_some(),
            "reference resolved"
        );
        *self.cache.lock() = Some((record.clone(), mark));
        Ok(record)
    }

    /// Like [`LazyReference::get`], failing with [`CoreError::NotFound`]
    /// when the target cannot be resolved.
    pub fn require(&self) -> CoreResult<Record> {
        let key = self.target_key().ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "{} has no {} reference",
                self.owner.model,
                self.target.name()
            ))
        })?;
        self.get()?
            .ok_or_else(|| CoreError::not_found(self.target.name(), &key))
    }
}

impl fmt::Debug for LazyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyReference")
            .field("target", &self.target.name())
            .field("identifiers", &self.identifiers)
            .finish_non_exhaustive()
    }
}

/// A has-many relationship resolved by an explicit [`LazyList::fetch`].
pub struct LazyList {
    owner: Owner,
    target: Arc<ModelSchema>,
    associated_fields: Vec<String>,
    cache: Mutex<Option<(Vec<Record>, LoadMark)>>,
}

impl LazyList {
    pub(crate) fn new(
        engine: Weak<EngineInner>,
        owner_model: &str,
        owner_key: ModelKey,
        target: Arc<ModelSchema>,
        associated_fields: Vec<String>,
    ) -> Self {
        Self {
            owner: Owner {
                engine,
                model: owner_model.to_string(),
                key: owner_key,
            },
            target,
            associated_fields,
            cache: Mutex::new(None),
        }
    }

    /// Child model name.
    pub fn target_model(&self) -> &str {
        self.target.name()
    }

    fn cached(&self, engine: &StorageEngine) -> Option<Vec<Record>> {
        let cache = self.cache.lock();
        let (items, mark) = cache.as_ref()?;

        let mut slots = vec![
            Slot::Children {
                model: self.target.name().to_string(),
                fields: self.associated_fields.clone(),
                parent: self.owner.key.clone(),
            },
            self.owner.slot(),
        ];
        // A child moved to another parent only bumps the new parent's slot.
        for item in items {
            if let Ok(key) = item.key(&self.target) {
                slots.push(Slot::Record {
                    model: self.target.name().to_string(),
                    key,
                });
            }
        }
        if engine.tracker().changed_since(mark.loaded_at(), &slots) {
            return None;
        }
        Some(items.clone())
    }

    /// Current state without triggering a fetch.
    pub fn state(&self) -> ListState {
        let loaded = self
            .owner
            .engine()
            .ok()
            .and_then(|engine| self.cached(&engine));
        match loaded {
            Some(items) => ListState::Loaded {
                count: items.len(),
                items,
            },
            None => ListState::NotLoaded {
                associated_ids: self.owner.key.clone(),
                associated_fields: self.associated_fields.clone(),
            },
        }
    }

    /// True if fetched items are cached and current.
    pub fn is_loaded(&self) -> bool {
        matches!(self.state(), ListState::Loaded { .. })
    }

    /// Item count if loaded and current.
    pub fn count(&self) -> Option<usize> {
        match self.state() {
            ListState::Loaded { count, .. } => Some(count),
            ListState::NotLoaded { .. } => None,
        }
    }

    /// Returns the children, querying storage unless the cached result is
    /// still current.
    pub fn fetch(&self) -> CoreResult<Vec<Record>> {
        let engine = self.owner.engine()?;
        engine.check_access()?;
        if let Some(items) = self.cached(&engine) {
            return Ok(items);
        }

        let mark = engine.tracker().mark();
        self.owner.ensure_present(&engine)?;
        let predicate = Predicate::fields_equal(&self.associated_fields, &self.owner.key)
            .ok_or_else(|| {
                CoreError::invalid_operation(format!(
                    "{} key does not match {} foreign key fields {:?}",
                    self.owner.model,
                    self.target.name(),
                    self.associated_fields
                ))
            })?;
        let items = engine.adapter().query(
            self.target.name(),
            Some(&predicate),
            &QueryOptions::default(),
        )?;
        trace!(
            model = %self.target.name(),
            parent = %self.owner.key,
            count = items.len(),
            "list fetched"
        );
        *self.cache.lock() = Some((items.clone(), mark));
        Ok(items)
    }

    /// Drops the cached items.
    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }
}

impl fmt::Debug for LazyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyList")
            .field("target", &self.target.name())
            .field("associated_fields", &self.associated_fields)
            .field("parent", &self.owner.key)
            .finish_non_exhaustive()
    }
}
