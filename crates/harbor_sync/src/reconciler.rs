//! The sync reconciler.
//!
//! Two kinds of background tasks run while the reconciler is started:
//!
//! - one outbound task draining the outbox, up to
//!   `max_concurrent_sends` sends at once, never two for the same key
//! - one inbound task per managed model polling the remote change stream
//!
//! Local saves wake the outbound task through an event bus listener, so a
//! mutation is sent as soon as it commits.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::policy::{ConflictPolicy, ConflictWinner, Resolution};
use crate::remote::{self, RemoteMutation, RemoteOutcome, RemoteService};
use crate::state::{ModelState, SyncEvent, SyncStats};
use harbor_core::{
    ApplyOutcome, CoreError, CoreResult, MutationEvent, MutationKind, MutationSource, OutboxEntry,
    RemoteFetch, RemoteRecord, StorageEngine,
};
use harbor_model::ModelKey;
use harbor_storage::WriteBatch;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Metadata namespace holding one inbound cursor per model.
pub const CURSOR_NAMESPACE: &str = "sync_cursor";

const EVENT_CAPACITY: usize = 256;

struct Shared<S> {
    engine: StorageEngine,
    remote: Arc<S>,
    config: SyncConfig,
    models: Vec<String>,
    policy: RwLock<ConflictPolicy>,
    states: RwLock<HashMap<String, ModelState>>,
    stats: Mutex<SyncStats>,
    events: broadcast::Sender<SyncEvent>,
    wake: Arc<Notify>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Keeps the local store and the remote service converging.
///
/// ```no_run
/// # async fn run() -> harbor_sync::SyncResult<()> {
/// use harbor_core::StorageEngine;
/// use harbor_sync::{MockRemote, Reconciler, SyncConfig};
/// use std::sync::Arc;
/// # let registry = harbor_model::ModelRegistry::builder().build().unwrap();
///
/// let engine = StorageEngine::in_memory(registry)?;
/// let reconciler = Reconciler::new(engine, Arc::new(MockRemote::new()), SyncConfig::new())?;
/// reconciler.start()?;
/// // ... local saves are pushed in the background ...
/// reconciler.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Reconciler<S: RemoteService> {
    shared: Arc<Shared<S>>,
    running: Mutex<Option<Running>>,
}

impl<S: RemoteService> Reconciler<S> {
    /// Creates a stopped reconciler.
    ///
    /// Fails if a configured model is unknown or not replicated.
    pub fn new(engine: StorageEngine, remote: Arc<S>, config: SyncConfig) -> SyncResult<Self> {
        let models = if config.models.is_empty() {
            engine.registry().synced_models()
        } else {
            for model in &config.models {
                let schema = engine.registry().get(model).map_err(CoreError::from)?;
                if !schema.sync_enabled() {
                    return Err(CoreError::configuration(format!(
                        "model {model} is local-only and cannot be synced"
                    ))
                    .into());
                }
            }
            config.models.clone()
        };

        let wake = Arc::new(Notify::new());
        let signal = Arc::clone(&wake);
        engine
            .bus()
            .add_listener(Arc::new(move |event: &MutationEvent| {
                if event.source == MutationSource::Local {
                    signal.notify_one();
                }
            }));

        let states = models
            .iter()
            .map(|m| (m.clone(), ModelState::Stopped))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                remote,
                config,
                models,
                policy: RwLock::new(ConflictPolicy::default()),
                states: RwLock::new(states),
                stats: Mutex::new(SyncStats::default()),
                events,
                wake,
            }),
            running: Mutex::new(None),
        })
    }

    /// Models this reconciler manages.
    pub fn models(&self) -> &[String] {
        &self.shared.models
    }

    /// Current state of `model`; `Stopped` for unmanaged models.
    pub fn state(&self, model: &str) -> ModelState {
        self.shared.state(model)
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.lock().clone()
    }

    /// Subscribes to sync progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Sets the conflict policy.
    pub fn set_conflict_policy(&self, policy: ConflictPolicy) {
        *self.shared.policy.write() = policy;
    }

    /// Gets the conflict policy.
    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.shared.policy.read().clone()
    }

    /// True while background tasks are running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawns the background tasks on the current Tokio runtime.
    pub fn start(&self) -> SyncResult<()> {
        let handle = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SyncError::InvalidStateTransition {
                from: "running".into(),
                to: "starting".into(),
            });
        }

        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.shared.models.len() + 1);
        for model in &self.shared.models {
            self.shared.set_state(model, ModelState::Starting);
            let shared = Arc::clone(&self.shared);
            tasks.push(handle.spawn(shared.run_inbound(model.clone(), rx.clone())));
        }
        tasks.push(handle.spawn(Arc::clone(&self.shared).run_outbound(rx)));
        *running = Some(Running { shutdown, tasks });
        info!(models = ?self.shared.models, "reconciler started");
        Ok(())
    }

    /// Stops the background tasks, waiting for outstanding sends.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(err) = task.await {
                error!(%err, "sync task failed");
            }
        }
        for model in &self.shared.models {
            self.shared.set_state(model, ModelState::Stopped);
        }
        info!("reconciler stopped");
    }

    /// Sends every outbox entry that is due now, and any that become due
    /// while doing so. Returns the number of sends attempted.
    ///
    /// Entries backing off after a failure are left for a later call.
    pub async fn push_pending(&self) -> usize {
        self.shared.push_pending().await
    }

    /// Polls the remote change stream for `model` until caught up. Returns
    /// the number of changes merged.
    pub async fn pull(&self, model: &str) -> SyncResult<usize> {
        self.shared.pull(model).await
    }

    /// Installs a [`RemoteFetch`] on the engine so lazy references can load
    /// records that are only known remotely.
    ///
    /// The fetch blocks the calling thread while the request runs on the
    /// current runtime; do not resolve references from inside a
    /// current-thread runtime.
    pub fn install_remote_fetch(&self) -> SyncResult<()> {
        let handle = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;
        self.shared.engine.set_remote_fetch(Arc::new(RemoteFetcher {
            remote: Arc::clone(&self.shared.remote),
            handle,
            timeout: self.shared.config.send_timeout,
        }));
        Ok(())
    }
}

impl<S: RemoteService> Drop for Reconciler<S> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown.send(true);
        }
    }
}

impl<S: RemoteService> Shared<S> {
    fn state(&self, model: &str) -> ModelState {
        self.states
            .read()
            .get(model)
            .copied()
            .unwrap_or(ModelState::Stopped)
    }

    fn set_state(&self, model: &str, state: ModelState) {
        let previous = self.states.write().insert(model.to_string(), state);
        if previous != Some(state) {
            info!(model, ?state, "sync state changed");
            self.emit(SyncEvent::StateChanged {
                model: model.to_string(),
                state,
            });
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn call<T>(&self, request: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.config.send_timeout, request)
            .await
            .unwrap_or_else(|_| Err(SyncError::Timeout))
    }

    fn dequeue(&self) -> Option<OutboxEntry> {
        self.engine.outbox().dequeue_where(|entry| {
            let model = entry.event.model.as_str();
            self.models.iter().any(|m| m == model) && self.state(model) != ModelState::Error
        })
    }

    async fn push_pending(self: &Arc<Self>) -> usize {
        let mut sends = JoinSet::new();
        let mut attempted = 0;
        loop {
            while sends.len() < self.config.max_concurrent_sends {
                let Some(entry) = self.dequeue() else {
                    break;
                };
                sends.spawn(Arc::clone(self).send_entry(entry));
            }
            match sends.join_next().await {
                Some(joined) => {
                    attempted += 1;
                    if let Err(err) = joined {
                        error!(%err, "outbound send task failed");
                    }
                }
                None => break,
            }
        }
        attempted
    }

    async fn run_outbound(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut sends = JoinSet::new();
        loop {
            while sends.len() < self.config.max_concurrent_sends {
                let Some(entry) = self.dequeue() else {
                    break;
                };
                sends.spawn(Arc::clone(&self).send_entry(entry));
            }
            let idle = self
                .engine
                .outbox()
                .next_due_in()
                .unwrap_or(self.config.poll_interval);

            tokio::select! {
                _ = shutdown.changed() => break,
                Some(joined) = sends.join_next(), if !sends.is_empty() => {
                    if let Err(err) = joined {
                        error!(%err, "outbound send task failed");
                    }
                }
                () = self.wake.notified() => {}
                () = tokio::time::sleep(idle) => {}
            }
        }
        while let Some(joined) = sends.join_next().await {
            if let Err(err) = joined {
                error!(%err, "outbound send task failed");
            }
        }
    }

    async fn send_entry(self: Arc<Self>, entry: OutboxEntry) {
        let mutation = match RemoteMutation::from_event(&entry.event) {
            Ok(mutation) => mutation,
            Err(err) => {
                self.fail_terminal(&entry, &err);
                return;
            }
        };
        self.stats.lock().sends += 1;
        debug!(
            seq = entry.seq,
            model = %entry.event.model,
            key = %entry.event.key,
            kind = ?entry.event.kind,
            expected_version = entry.event.version,
            "sending mutation"
        );

        let sent = self.call(remote::send(&*self.remote, mutation)).await;
        match sent {
            Ok(RemoteOutcome::Applied { version }) => self.on_applied(&entry, version),
            Ok(RemoteOutcome::Conflict) => self.on_conflict(&entry).await,
            Err(err) => self.on_failure(&entry, err),
        }
    }

    fn on_applied(&self, entry: &OutboxEntry, version: u64) {
        if let Err(err) = self.engine.acknowledge(entry.seq, version) {
            self.on_failure(entry, err.into());
            return;
        }
        {
            let mut stats = self.stats.lock();
            stats.acknowledged += 1;
            stats.last_sync_time = Some(Instant::now());
        }
        debug!(seq = entry.seq, version, "mutation applied remotely");
        self.emit(SyncEvent::OutboundApplied {
            seq: entry.seq,
            model: entry.event.model.clone(),
            key: entry.event.key.clone(),
            version,
        });
    }

    async fn on_conflict(&self, entry: &OutboxEntry) {
        let model = entry.event.model.clone();
        let key = entry.event.key.clone();
        warn!(seq = entry.seq, model = %model, key = %key, "remote reported a conflict");

        let fetched = self
            .call(self.remote.fetch(model.clone(), key.clone()))
            .await;
        let remote = match fetched {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                self.fail_terminal(
                    entry,
                    &SyncError::Conflict {
                        model,
                        key: key.to_string(),
                    },
                );
                return;
            }
            Err(err) => {
                self.on_failure(entry, err);
                return;
            }
        };

        // An earlier attempt landed but its response was lost.
        if entry.attempted && already_applied(entry, &remote) {
            info!(seq = entry.seq, model = %model, key = %key, version = remote.version, "earlier attempt already applied");
            self.on_applied(entry, remote.version);
            return;
        }
        self.stats.lock().conflicts += 1;

        let resolution = self.policy.read().resolve(&entry.event, &remote);
        match resolution {
            Resolution::AcceptRemote => {
                let version = remote.version;
                if let Err(err) = self.engine.accept_remote(remote) {
                    self.on_failure(entry, err.into());
                    return;
                }
                info!(model = %model, key = %key, version, "conflict resolved, remote wins");
                self.emit(SyncEvent::ConflictResolved {
                    model,
                    key,
                    winner: ConflictWinner::Remote,
                });
            }
            Resolution::RetryLocal => {
                if self.config.retry.is_exhausted(entry.retry_count + 1) {
                    self.fail_terminal(
                        entry,
                        &SyncError::Conflict {
                            model,
                            key: key.to_string(),
                        },
                    );
                    return;
                }
                if let Err(err) =
                    self.engine
                        .outbox()
                        .requeue_rebased(entry.seq, Duration::ZERO, remote.version)
                {
                    error!(seq = entry.seq, %err, "failed to rebase outbox entry");
                    return;
                }
                info!(model = %model, key = %key, version = remote.version, "conflict resolved, resending local");
                self.emit(SyncEvent::ConflictResolved {
                    model,
                    key,
                    winner: ConflictWinner::Local,
                });
            }
        }
    }

    fn on_failure(&self, entry: &OutboxEntry, err: SyncError) {
        let attempts = entry.retry_count + 1;
        if !err.is_retryable() || self.config.retry.is_exhausted(attempts) {
            self.fail_terminal(entry, &err);
            return;
        }
        let delay = self.config.retry.delay_for_attempt(attempts);
        match self.engine.outbox().requeue(entry.seq, delay) {
            Ok(retry) => {
                let mut stats = self.stats.lock();
                stats.retries += 1;
                stats.last_error = Some(err.to_string());
                warn!(seq = entry.seq, retry, error = %err, "send failed, will retry");
            }
            Err(requeue_err) => {
                error!(seq = entry.seq, error = %requeue_err, "failed to requeue outbox entry");
            }
        }
    }

    fn fail_terminal(&self, entry: &OutboxEntry, err: &SyncError) {
        error!(
            seq = entry.seq,
            model = %entry.event.model,
            key = %entry.event.key,
            error = %err,
            "mutation could not be synced"
        );
        if let Err(discard_err) = self.engine.outbox().discard(entry.seq) {
            error!(seq = entry.seq, error = %discard_err, "failed to discard outbox entry");
        }
        {
            let mut stats = self.stats.lock();
            stats.terminal_failures += 1;
            stats.last_error = Some(err.to_string());
        }
        self.emit(SyncEvent::TerminalFailure {
            seq: entry.seq,
            model: entry.event.model.clone(),
            key: entry.event.key.clone(),
            error: err.to_string(),
        });
    }

    fn load_cursor(&self, model: &str) -> SyncResult<u64> {
        let stored = self
            .engine
            .adapter()
            .meta_get(CURSOR_NAMESPACE, model)
            .map_err(CoreError::from)?;
        Ok(stored
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map_or(0, u64::from_le_bytes))
    }

    fn store_cursor(&self, model: &str, cursor: u64) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.put_meta(CURSOR_NAMESPACE, model, cursor.to_le_bytes().to_vec());
        self.engine
            .adapter()
            .apply(batch)
            .map_err(CoreError::from)?;
        Ok(())
    }

    async fn pull(&self, model: &str) -> SyncResult<usize> {
        let batch_size = self.config.inbound_batch_size;
        let mut cursor = self.load_cursor(model)?;
        let mut applied = 0;
        loop {
            let changes = self
                .call(self.remote.poll(model.to_string(), cursor, batch_size))
                .await?;
            let caught_up = changes.len() < batch_size;
            let start = cursor;
            for change in changes {
                cursor = change.cursor;
                match self.engine.apply_remote(change.remote)? {
                    ApplyOutcome::Applied(event) => {
                        applied += 1;
                        {
                            let mut stats = self.stats.lock();
                            stats.inbound_applied += 1;
                            stats.last_sync_time = Some(Instant::now());
                        }
                        self.emit(SyncEvent::InboundApplied {
                            model: event.model,
                            key: event.key,
                            version: event.version,
                        });
                    }
                    ApplyOutcome::Stale | ApplyOutcome::PendingLocal => {
                        self.stats.lock().inbound_skipped += 1;
                    }
                }
            }
            if cursor != start {
                self.store_cursor(model, cursor)?;
            }
            if caught_up || cursor == start {
                break;
            }
        }
        debug!(model, cursor, applied, "inbound pass complete");
        Ok(applied)
    }

    async fn run_inbound(self: Arc<Self>, model: String, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        loop {
            let delay = match self.pull(&model).await {
                Ok(_) => {
                    failures = 0;
                    if self.state(&model) == ModelState::Starting {
                        self.engine.mark_model_synced(&model);
                        self.set_state(&model, ModelState::Syncing);
                        self.emit(SyncEvent::ModelSynced {
                            model: model.clone(),
                        });
                    }
                    self.config.poll_interval
                }
                Err(err) => {
                    failures += 1;
                    self.stats.lock().last_error = Some(err.to_string());
                    if !err.is_retryable() || self.config.retry.is_exhausted(failures) {
                        error!(model = %model, error = %err, "inbound sync failed");
                        self.set_state(&model, ModelState::Error);
                        return;
                    }
                    warn!(model = %model, error = %err, attempt = failures, "inbound poll failed, will retry");
                    self.config.retry.delay_for_attempt(failures)
                }
            };

            tokio::select! {
                _ = shutdown.changed() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// True if the remote state is exactly what sending `entry` would produce.
fn already_applied(entry: &OutboxEntry, remote: &RemoteRecord) -> bool {
    match entry.event.kind {
        MutationKind::Delete => remote.deleted,
        MutationKind::Create | MutationKind::Update => {
            !remote.deleted
                && entry
                    .event
                    .record()
                    .is_ok_and(|local| local.fields() == remote.record.fields())
        }
    }
}

/// A [`RemoteFetch`] that runs [`RemoteService::fetch`] on a Tokio runtime
/// and waits for it on the calling thread.
pub struct RemoteFetcher<S> {
    remote: Arc<S>,
    handle: Handle,
    timeout: Duration,
}

impl<S: RemoteService> RemoteFetch for RemoteFetcher<S> {
    fn fetch(&self, model: &str, key: &ModelKey) -> CoreResult<Option<RemoteRecord>> {
        let (tx, rx) = mpsc::channel();
        let remote = Arc::clone(&self.remote);
        let (owned_model, owned_key) = (model.to_string(), key.clone());
        self.handle.spawn(async move {
            let _ = tx.send(remote.fetch(owned_model, owned_key).await);
        });
        match rx.recv_timeout(self.timeout) {
            Ok(result) => result.map_err(CoreError::from),
            Err(RecvTimeoutError::Timeout) => Err(CoreError::Timeout {
                message: format!("fetching {model} {key}"),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CoreError::configuration("sync runtime is shutting down"))
            }
        }
    }
}
