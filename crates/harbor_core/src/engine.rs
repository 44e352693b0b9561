//! The storage engine facade.

use crate::bus::{EventBus, Subscription};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::event::{now_millis, MutationEvent, MutationKind, MutationSource};
use crate::invalidation::InvalidationTracker;
use crate::model::Model;
use crate::observe::QueryObservation;
use crate::outbox::{Outbox, OutboxState};
use crate::remote::{ApplyOutcome, RemoteFetch, RemoteRecord};
use harbor_model::{
    Association, DeleteRule, ModelKey, ModelRegistry, ModelSchema, Predicate, Record,
};
use harbor_storage::{MemoryStore, QueryOptions, StorageAdapter, WriteBatch};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Metadata namespace holding remote deletion versions.
const TOMBSTONE_NAMESPACE: &str = "tombstone";

pub(crate) struct EngineInner {
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) adapter: Arc<dyn StorageAdapter>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) outbox: Outbox,
    pub(crate) tracker: Arc<InvalidationTracker>,
    writer: Mutex<()>,
    config: EngineConfig,
    remote_fetch: RwLock<Option<Arc<dyn RemoteFetch>>>,
    synced: RwLock<HashSet<String>>,
}

/// Orchestrates local storage, the outbox and the event bus.
///
/// Cloning is cheap; clones share the same engine.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`. Writes are serialized: the existence check,
/// the adapter commit, the outbox update and event publication of one
/// operation never interleave with another write. Reads go straight to the
/// adapter.
///
/// # Example
///
/// ```
/// use harbor_core::StorageEngine;
/// use harbor_model::{ModelRegistry, ModelSchema, Record, ValueType};
///
/// let registry = ModelRegistry::builder()
///     .register(
///         ModelSchema::builder("Post")
///             .field("id", ValueType::Id)
///             .field("title", ValueType::Text)
///             .build()
///             .unwrap(),
///     )
///     .build()
///     .unwrap();
/// let engine = StorageEngine::in_memory(registry).unwrap();
///
/// engine
///     .save(Record::new("Post").with("id", "p1").with("title", "hello"), None)
///     .unwrap();
/// assert_eq!(engine.query("Post", None).unwrap().len(), 1);
/// assert_eq!(engine.outbox().len(), 1);
/// ```
#[derive(Clone)]
pub struct StorageEngine {
    inner: Arc<EngineInner>,
}

impl StorageEngine {
    /// Opens an engine over `adapter`, recovering the persisted outbox.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The adapter is closed ([`CoreError::Configuration`])
    /// - The persisted outbox cannot be read or decoded
    pub fn open(
        registry: Arc<ModelRegistry>,
        adapter: Arc<dyn StorageAdapter>,
        config: EngineConfig,
    ) -> CoreResult<Self> {
        if !adapter.is_available() {
            return Err(CoreError::configuration("storage adapter is not available"));
        }
        let outbox = Outbox::load(Arc::clone(&adapter))?;
        let bus = Arc::new(EventBus::new(config.event_buffer_capacity));
        let tracker = Arc::new(InvalidationTracker::new(Arc::clone(&registry)));

        let listener = Arc::clone(&tracker);
        bus.add_listener(Arc::new(move |event| listener.observe(event)));

        info!(
            models = registry.models().count(),
            pending = outbox.len(),
            "storage engine opened"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                registry,
                adapter,
                bus,
                outbox,
                tracker,
                writer: Mutex::new(()),
                config,
                remote_fetch: RwLock::new(None),
                synced: RwLock::new(HashSet::new()),
            }),
        })
    }

    /// An engine over a fresh in-memory store.
    pub fn in_memory(registry: Arc<ModelRegistry>) -> CoreResult<Self> {
        Self::open(
            registry,
            Arc::new(MemoryStore::in_memory()),
            EngineConfig::default(),
        )
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn tracker(&self) -> &Arc<InvalidationTracker> {
        &self.inner.tracker
    }

    /// The model registry.
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    /// The storage adapter.
    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.inner.adapter
    }

    /// The mutation event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// The outbound mutation queue.
    pub fn outbox(&self) -> &Outbox {
        &self.inner.outbox
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Installs the collaborator lazy references use for records missing
    /// locally.
    pub fn set_remote_fetch(&self, fetch: Arc<dyn RemoteFetch>) {
        *self.inner.remote_fetch.write() = Some(fetch);
    }

    /// Fails unless the calling thread may use the store right now.
    pub fn check_access(&self) -> CoreResult<()> {
        self.inner.adapter.check_access().map_err(CoreError::from)
    }

    fn schema(&self, model: &str) -> CoreResult<Arc<ModelSchema>> {
        Ok(Arc::clone(self.inner.registry.get(model)?))
    }

    fn build_event(
        &self,
        kind: MutationKind,
        record: &Record,
        key: &ModelKey,
        source: MutationSource,
    ) -> CoreResult<MutationEvent> {
        MutationEvent::build(
            kind,
            record,
            key.clone(),
            source,
            self.inner.config.max_payload_bytes,
        )
    }

    fn is_synced_model(&self, model: &str) -> bool {
        self.inner
            .registry
            .get(model)
            .map(|s| s.sync_enabled())
            .unwrap_or(false)
    }

    /// Stages outbox entries for local events of replicated models.
    fn stage_outbound(
        &self,
        state: &mut OutboxState,
        events: &[MutationEvent],
        batch: &mut WriteBatch,
    ) -> CoreResult<()> {
        for event in events.iter().filter(|e| self.is_synced_model(&e.model)) {
            if let Err(err) = state.stage(event.clone(), batch) {
                state.rollback();
                return Err(err);
            }
        }
        Ok(())
    }

    fn commit(&self, state: &mut OutboxState, batch: WriteBatch) -> CoreResult<()> {
        match self.inner.adapter.apply(batch) {
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

    fn publish(&self, events: &[MutationEvent]) {
        for event in events {
            self.inner.bus.publish(event);
        }
    }

    /// Creates or replaces a record.
    ///
    /// The mutation kind is decided by whether a record with the same key
    /// is stored. With a `condition`, the stored record must exist and
    /// satisfy it. The stored `version` is preserved; only the remote
    /// advances it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The model is not registered or the record does not fit its schema
    /// - A `condition` is given but no record is stored
    ///   ([`CoreError::InvalidOperation`])
    /// - The stored record fails the `condition` ([`CoreError::ConditionFailed`])
    /// - The adapter is unavailable or the commit fails
    ///
    /// Nothing is stored, queued or published when an error is returned.
    ///
    /// # Example
    ///
    /// ```
    /// use harbor_core::{CoreError, StorageEngine};
    /// use harbor_model::{field, ModelRegistry, ModelSchema, Record, ValueType};
    ///
    /// let registry = ModelRegistry::builder()
    ///     .register(
    ///         ModelSchema::builder("Post")
    ///             .field("id", ValueType::Id)
    ///             .field("rating", ValueType::Integer)
    ///             .build()
    ///             .unwrap(),
    ///     )
    ///     .build()
    ///     .unwrap();
    /// let engine = StorageEngine::in_memory(registry).unwrap();
    /// engine
    ///     .save(Record::new("Post").with("id", "p1").with("rating", 3), None)
    ///     .unwrap();
    ///
    /// let refused = engine.save(
    ///     Record::new("Post").with("id", "p1").with("rating", 5),
    ///     Some(&field("rating").gt(4)),
    /// );
    /// assert!(matches!(refused, Err(CoreError::ConditionFailed { .. })));
    /// ```
    pub fn save(
        &self,
        record: impl Into<Record>,
        condition: Option<&Predicate>,
    ) -> CoreResult<Model> {
        let mut record = record.into();
        let schema = self.schema(record.model())?;
        record.validate(&schema)?;
        let key = record.key(&schema)?;

        if !self.inner.adapter.is_available() {
            return Err(CoreError::configuration("storage adapter is not available"));
        }

        let _writer = self.inner.writer.lock();
        let existing = self
            .inner
            .adapter
            .get(schema.name(), &key)
            .map_err(CoreError::existence_check)?;

        if let Some(condition) = condition {
            match &existing {
                None => {
                    return Err(CoreError::invalid_operation(format!(
                        "condition given for {} {} which does not exist",
                        schema.name(),
                        key
                    )))
                }
                Some(stored) if !condition.evaluate(stored) => {
                    return Err(CoreError::ConditionFailed {
                        model: schema.name().to_string(),
                        key: key.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        let kind = if existing.is_some() {
            MutationKind::Update
        } else {
            MutationKind::Create
        };
        record.set_version(existing.as_ref().map_or(0, Record::version));
        record.set_last_changed_at(now_millis());

        let event = self.build_event(kind, &record, &key, MutationSource::Local)?;
        let events = [event];

        let mut state = self.inner.outbox.lock();
        let mut batch = WriteBatch::new();
        batch.put(key.clone(), record.clone());
        self.stage_outbound(&mut state, &events, &mut batch)?;
        self.commit(&mut state, batch)?;
        drop(state);

        debug!(model = %schema.name(), key = %key, ?kind, "record saved");
        self.publish(&events);
        Model::load(self, schema, record)
    }

    /// Reads every record of `model` matching `predicate`.
    pub fn query(&self, model: &str, predicate: Option<&Predicate>) -> CoreResult<Vec<Model>> {
        self.query_with(model, predicate, &QueryOptions::default())
    }

    /// Reads records with sorting and pagination.
    pub fn query_with(
        &self,
        model: &str,
        predicate: Option<&Predicate>,
        options: &QueryOptions,
    ) -> CoreResult<Vec<Model>> {
        let schema = self.schema(model)?;
        self.inner
            .adapter
            .query(model, predicate, options)?
            .into_iter()
            .map(|record| Model::load(self, Arc::clone(&schema), record))
            .collect()
    }

    /// Reads the record with primary key `key`.
    ///
    /// # Errors
    ///
    /// More than one match means the store is corrupt and is reported as
    /// [`CoreError::NonUniqueResult`]. Adapter failures are passed through.
    pub fn query_by_id(&self, model: &str, key: &ModelKey) -> CoreResult<Option<Model>> {
        let schema = self.schema(model)?;
        match self.find_by_key(&schema, key)? {
            Some(record) => Ok(Some(Model::load(self, schema, record)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn find_by_key(
        &self,
        schema: &ModelSchema,
        key: &ModelKey,
    ) -> CoreResult<Option<Record>> {
        let predicate = Predicate::key_equals(schema, key)?;
        let mut found =
            self.inner
                .adapter
                .query(schema.name(), Some(&predicate), &QueryOptions::default())?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            count => Err(CoreError::NonUniqueResult {
                model: schema.name().to_string(),
                count,
            }),
        }
    }

    /// Counts records of `model` matching `predicate`.
    pub fn count(&self, model: &str, predicate: Option<&Predicate>) -> CoreResult<usize> {
        self.schema(model)?;
        Ok(self.inner.adapter.count(model, predicate)?)
    }

    /// Deletes a record by value. See [`StorageEngine::delete_by_id`].
    pub fn delete(&self, record: &Record) -> CoreResult<usize> {
        let schema = self.schema(record.model())?;
        let key = record.key(&schema)?;
        self.delete_by_id(schema.name(), &key)
    }

    /// Deletes the record with `key` and, through cascading has-many
    /// associations, its descendants.
    ///
    /// Every deleted record gets its own delete event. Children are deleted
    /// and published before their parent. Returns the number of records
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the record is absent, or an error
    /// from the adapter. A failed delete removes nothing.
    pub fn delete_by_id(&self, model: &str, key: &ModelKey) -> CoreResult<usize> {
        let schema = self.schema(model)?;
        let _writer = self.inner.writer.lock();
        let record = self
            .inner
            .adapter
            .get(model, key)
            .map_err(CoreError::existence_check)?
            .ok_or_else(|| CoreError::not_found(model, key))?;

        let mut doomed = Vec::new();
        self.collect_deletes(&schema, record, key.clone(), &mut doomed, &mut HashSet::new())?;
        self.delete_collected(doomed)
    }

    /// Deletes every record of `model` matching `predicate`, cascading like
    /// [`StorageEngine::delete_by_id`]. Returns the number of records
    /// deleted.
    pub fn delete_where(&self, model: &str, predicate: &Predicate) -> CoreResult<usize> {
        let schema = self.schema(model)?;
        let _writer = self.inner.writer.lock();
        let matches = self
            .inner
            .adapter
            .query(model, Some(predicate), &QueryOptions::default())?;

        let mut doomed = Vec::new();
        let mut seen = HashSet::new();
        for record in matches {
            let key = record.key(&schema)?;
            self.collect_deletes(&schema, record, key, &mut doomed, &mut seen)?;
        }
        self.delete_collected(doomed)
    }

    fn collect_deletes(
        &self,
        schema: &Arc<ModelSchema>,
        record: Record,
        key: ModelKey,
        out: &mut Vec<(ModelKey, Record)>,
        seen: &mut HashSet<(String, ModelKey)>,
    ) -> CoreResult<()> {
        if !seen.insert((schema.name().to_string(), key.clone())) {
            return Ok(());
        }
        if self.inner.config.cascade_deletes {
            for association in schema.has_many() {
                let Association::HasMany {
                    target,
                    associated_with,
                    on_delete: DeleteRule::Cascade,
                    ..
                } = association
                else {
                    continue;
                };
                let Some(predicate) = Predicate::fields_equal(associated_with, &key) else {
                    continue;
                };
                let child_schema = self.schema(target)?;
                let children =
                    self.inner
                        .adapter
                        .query(target, Some(&predicate), &QueryOptions::default())?;
                for child in children {
                    let child_key = child.key(&child_schema)?;
                    self.collect_deletes(&child_schema, child, child_key, out, seen)?;
                }
            }
        }
        out.push((key, record));
        Ok(())
    }

    fn delete_collected(&self, doomed: Vec<(ModelKey, Record)>) -> CoreResult<usize> {
        if doomed.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        let mut events = Vec::with_capacity(doomed.len());
        for (key, record) in &doomed {
            events.push(self.build_event(MutationKind::Delete, record, key, MutationSource::Local)?);
            batch.delete(record.model(), key.clone());
        }

        let mut state = self.inner.outbox.lock();
        self.stage_outbound(&mut state, &events, &mut batch)?;
        self.commit(&mut state, batch)?;
        drop(state);

        for event in &events {
            debug!(model = %event.model, key = %event.key, "record deleted");
        }
        self.publish(&events);
        Ok(events.len())
    }

    /// Merges a record received from the remote service.
    ///
    /// Applied only when its version is strictly greater than both the
    /// stored version and any remembered remote deletion, and no local
    /// mutation for the key is still queued. Replaying an event is a no-op.
    pub fn apply_remote(&self, remote: RemoteRecord) -> CoreResult<ApplyOutcome> {
        let schema = self.schema(remote.record.model())?;
        let key = remote.record.key(&schema)?;

        let _writer = self.inner.writer.lock();
        let mut state = self.inner.outbox.lock();
        if state.has_pending(schema.name(), &key) {
            debug!(model = %schema.name(), key = %key, "inbound change deferred to pending local mutation");
            return Ok(ApplyOutcome::PendingLocal);
        }

        let existing = self.inner.adapter.get(schema.name(), &key)?;
        let local_version = existing
            .as_ref()
            .map_or(0, Record::version)
            .max(self.tombstone(schema.name(), &key)?);
        if remote.version <= local_version {
            debug!(
                model = %schema.name(),
                key = %key,
                version = remote.version,
                local_version,
                "stale inbound change dropped"
            );
            return Ok(ApplyOutcome::Stale);
        }

        let mut batch = WriteBatch::new();
        let event = self.stage_remote(&schema, &key, existing, remote, &mut batch)?;
        self.commit(&mut state, batch)?;
        drop(state);

        match event {
            Some(event) => {
                self.publish(std::slice::from_ref(&event));
                Ok(ApplyOutcome::Applied(event))
            }
            None => Ok(ApplyOutcome::Stale),
        }
    }

    /// Resolves a conflict in favor of the remote: every queued mutation
    /// for the key is discarded and local storage is overwritten with
    /// `remote`, all in one commit. Publishes one event if local state
    /// changed.
    pub fn accept_remote(&self, remote: RemoteRecord) -> CoreResult<Option<MutationEvent>> {
        let schema = self.schema(remote.record.model())?;
        let key = remote.record.key(&schema)?;

        let _writer = self.inner.writer.lock();
        let mut state = self.inner.outbox.lock();
        let existing = self.inner.adapter.get(schema.name(), &key)?;

        let mut batch = WriteBatch::new();
        let discarded = state.stage_discard_key(schema.name(), &key, &mut batch);
        let event = match self.stage_remote(&schema, &key, existing, remote, &mut batch) {
            Ok(event) => event,
            Err(err) => {
                state.rollback();
                return Err(err);
            }
        };
        self.commit(&mut state, batch)?;
        drop(state);

        warn!(model = %schema.name(), key = %key, discarded, "local mutations superseded by remote");
        if let Some(event) = &event {
            self.publish(std::slice::from_ref(event));
        }
        Ok(event)
    }

    fn stage_remote(
        &self,
        schema: &ModelSchema,
        key: &ModelKey,
        existing: Option<Record>,
        remote: RemoteRecord,
        batch: &mut WriteBatch,
    ) -> CoreResult<Option<MutationEvent>> {
        let tombstone_key = tombstone_key(schema.name(), key);
        if remote.deleted {
            batch.put_meta(
                TOMBSTONE_NAMESPACE,
                tombstone_key,
                remote.version.to_le_bytes().to_vec(),
            );
            let Some(mut previous) = existing else {
                return Ok(None);
            };
            previous.set_version(remote.version);
            let event =
                self.build_event(MutationKind::Delete, &previous, key, MutationSource::Remote)?;
            batch.delete(schema.name(), key.clone());
            return Ok(Some(event));
        }

        let mut record = remote.record;
        record.validate(schema)?;
        record.set_version(remote.version);
        record.set_last_changed_at(now_millis());
        let kind = if existing.is_some() {
            MutationKind::Update
        } else {
            MutationKind::Create
        };
        let event = self.build_event(kind, &record, key, MutationSource::Remote)?;
        batch.put(key.clone(), record);
        batch.delete_meta(TOMBSTONE_NAMESPACE, tombstone_key);
        Ok(Some(event))
    }

    fn tombstone(&self, model: &str, key: &ModelKey) -> CoreResult<u64> {
        let stored = self
            .inner
            .adapter
            .meta_get(TOMBSTONE_NAMESPACE, &tombstone_key(model, key))?;
        Ok(stored
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map_or(0, u64::from_le_bytes))
    }

    /// Records that the remote applied outbox entry `seq` at `version`.
    ///
    /// Removes the entry, rebases later entries for the key, and stores the
    /// new version on the local record. No event is published: the record's
    /// content did not change.
    pub fn acknowledge(&self, seq: u64, version: u64) -> CoreResult<()> {
        let _writer = self.inner.writer.lock();
        let mut state = self.inner.outbox.lock();
        let mut batch = WriteBatch::new();
        let acked = match state.stage_acknowledge(seq, version, &mut batch) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(()),
            Err(err) => {
                state.rollback();
                return Err(err);
            }
        };

        let model = acked.event.model.as_str();
        let key = &acked.event.key;
        if acked.event.kind == MutationKind::Delete {
            batch.put_meta(
                TOMBSTONE_NAMESPACE,
                tombstone_key(model, key),
                version.to_le_bytes().to_vec(),
            );
        } else if let Some(mut record) = self.inner.adapter.get(model, key)? {
            if record.version() < version {
                record.set_version(version);
                batch.put(key.clone(), record);
            }
        }
        self.commit(&mut state, batch)?;
        debug!(seq, model, key = %key, version, "mutation acknowledged");
        Ok(())
    }

    /// Looks a record up remotely through the installed [`RemoteFetch`] and
    /// merges it. Returns the local record afterwards.
    pub(crate) fn fetch_remote(
        &self,
        schema: &ModelSchema,
        key: &ModelKey,
    ) -> CoreResult<Option<Record>> {
        let fetch = self.inner.remote_fetch.read().clone();
        let Some(fetch) = fetch else {
            return Ok(None);
        };
        let Some(remote) = fetch.fetch(schema.name(), key)? else {
            return Ok(None);
        };
        let outcome = self.apply_remote(remote)?;
        debug!(model = %schema.name(), key = %key, applied = outcome.is_applied(), "remote fetch merged");
        self.find_by_key(schema, key)
    }

    /// Subscribes to mutation events of `model`.
    pub fn observe(&self, model: &str) -> Subscription {
        self.inner.bus.subscribe_model(model)
    }

    /// Subscribes to every mutation event.
    pub fn observe_all(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    /// Observes the result set of a query. The first snapshot is the current
    /// state; another follows each committed change to `model`.
    pub fn observe_query(
        &self,
        model: &str,
        predicate: Option<Predicate>,
    ) -> CoreResult<QueryObservation> {
        self.schema(model)?;
        Ok(QueryObservation::new(self.clone(), model, predicate))
    }

    /// Marks `model` as fully synchronized with the remote.
    pub fn mark_model_synced(&self, model: &str) {
        if self.inner.synced.write().insert(model.to_string()) {
            info!(model, "model synced");
        }
    }

    /// True once the reconciler has completed an initial sync of `model`.
    pub fn is_model_synced(&self, model: &str) -> bool {
        self.inner.synced.read().contains(model)
    }

    /// Drops every record, outbox entry and sync cursor, and invalidates
    /// every lazy relationship.
    pub fn clear(&self) -> CoreResult<()> {
        let _writer = self.inner.writer.lock();
        let mut state = self.inner.outbox.lock();
        let mut batch = WriteBatch::new();
        batch.clear();
        self.inner.adapter.apply(batch)?;
        state.reset();
        drop(state);

        self.inner.tracker.reset();
        self.inner.synced.write().clear();
        info!("store cleared");
        Ok(())
    }
}

fn tombstone_key(model: &str, key: &ModelKey) -> String {
    format!("{model}/{key}")
}
