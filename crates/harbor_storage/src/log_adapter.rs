//! Storage adapter over an append-only frame log.

use crate::adapter::{StorageAdapter, StoreStats};
use crate::backend::LogBackend;
use crate::batch::WriteBatch;
use crate::config::AdapterConfig;
use crate::dir::StoreDir;
use crate::error::{StorageError, StorageResult};
use crate::frame::{self, encode_frame};
use crate::memory::MemoryLog;
use crate::query::QueryOptions;
use crate::tables::Tables;
use harbor_model::{ModelKey, Predicate, Record};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

/// A [`StorageAdapter`] that keeps its tables in memory and every committed
/// batch in a durable log.
///
/// Opening replays the log. Writers are serialized by the backend lock and
/// the in-memory tables are swapped under a write lock only after the frame
/// is durable, so readers see whole batches or nothing.
///
/// # Thread Safety
///
/// Shareable across threads unless opened with
/// [`AdapterConfig::thread_confined`], in which case only the opening
/// thread may use it.
///
/// # Example
///
/// ```
/// use harbor_model::{ModelKey, Record};
/// use harbor_storage::{AdapterConfig, LogAdapter, MemoryLog, StorageAdapter, WriteBatch};
///
/// let log = MemoryLog::new();
/// let store = LogAdapter::open(log.clone(), AdapterConfig::default()).unwrap();
/// let mut batch = WriteBatch::new();
/// batch.put(ModelKey::from("p1"), Record::new("Post").with("id", "p1"));
/// store.apply(batch).unwrap();
/// drop(store);
///
/// let reopened = LogAdapter::open(log, AdapterConfig::default()).unwrap();
/// assert!(reopened.exists("Post", &ModelKey::from("p1")).unwrap());
/// ```
pub struct LogAdapter<B: LogBackend> {
    backend: Mutex<B>,
    tables: RwLock<Tables>,
    config: AdapterConfig,
    owner: ThreadId,
    open: AtomicBool,
    frames: AtomicU64,
    _dir: Option<StoreDir>,
}

/// Adapter over a [`MemoryLog`].
pub type MemoryStore = LogAdapter<MemoryLog>;

impl MemoryStore {
    /// An empty in-memory store with default configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::assemble(
            MemoryLog::new(),
            Tables::default(),
            0,
            AdapterConfig::default(),
            None,
        )
    }
}

impl<B: LogBackend> LogAdapter<B> {
    /// Opens an adapter over `backend`, replaying every complete frame.
    ///
    /// A torn frame at the end of the log is cut off.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] for damage anywhere but the tail,
    /// or an I/O error from the backend.
    pub fn open(backend: B, config: AdapterConfig) -> StorageResult<Self> {
        Self::recover(backend, config, None)
    }

    pub(crate) fn recover(
        mut backend: B,
        config: AdapterConfig,
        dir: Option<StoreDir>,
    ) -> StorageResult<Self> {
        let bytes = backend.read_all()?;
        let scan = frame::scan(&bytes)?;
        if scan.torn_bytes > 0 {
            warn!(
                torn_bytes = scan.torn_bytes,
                valid_bytes = scan.valid_len,
                "discarding incomplete frame at end of log"
            );
            backend.truncate(scan.valid_len)?;
        }

        let frames = scan.frames.len() as u64;
        let mut tables = Tables::default();
        for ops in scan.frames {
            for op in ops {
                tables.apply(op);
            }
        }
        debug!(frames, bytes = scan.valid_len, "log replayed");

        Ok(Self::assemble(backend, tables, frames, config, dir))
    }

    fn assemble(
        backend: B,
        tables: Tables,
        frames: u64,
        config: AdapterConfig,
        dir: Option<StoreDir>,
    ) -> Self {
        Self {
            backend: Mutex::new(backend),
            tables: RwLock::new(tables),
            config,
            owner: thread::current().id(),
            open: AtomicBool::new(true),
            frames: AtomicU64::new(frames),
            _dir: dir,
        }
    }

    /// The configuration the adapter was opened with.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Rewrites the log as one frame holding the current tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is unusable or the backend cannot
    /// replace the log. The old log stays valid in that case.
    pub fn compact(&self) -> StorageResult<CompactionReport> {
        self.check_access()?;
        let mut backend = self.backend.lock();
        let bytes_before = backend.size()?;
        let frames_before = self.frames.load(Ordering::Acquire);

        let snapshot = encode_frame(&self.tables.read().snapshot_ops())?;
        backend.replace(&snapshot)?;
        self.frames.store(1, Ordering::Release);

        let report = CompactionReport {
            frames_before,
            bytes_before,
            bytes_after: snapshot.len() as u64,
        };
        info!(
            frames_before,
            bytes_before,
            bytes_after = report.bytes_after,
            "log compacted"
        );
        Ok(report)
    }

    /// Re-reads the log and checks every frame.
    pub fn verify(&self) -> StorageResult<LogReport> {
        let backend = self.backend.lock();
        verify_log(&*backend)
    }

    fn append_frame(backend: &mut B, frame: &[u8], sync: bool) -> StorageResult<()> {
        backend.append(frame)?;
        backend.flush()?;
        if sync {
            backend.sync()?;
        }
        Ok(())
    }
}

impl<B: LogBackend> StorageAdapter for LogAdapter<B> {
    fn get(&self, model: &str, key: &ModelKey) -> StorageResult<Option<Record>> {
        self.check_access()?;
        Ok(self.tables.read().get(model, key).cloned())
    }

    fn query(
        &self,
        model: &str,
        predicate: Option<&Predicate>,
        options: &QueryOptions,
    ) -> StorageResult<Vec<Record>> {
        self.check_access()?;
        let mut records: Vec<Record> = self
            .tables
            .read()
            .scan(model, predicate)
            .cloned()
            .collect();
        options.apply(&mut records);
        Ok(records)
    }

    fn count(&self, model: &str, predicate: Option<&Predicate>) -> StorageResult<usize> {
        self.check_access()?;
        Ok(self.tables.read().scan(model, predicate).count())
    }

    fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        self.check_access()?;
        if batch.is_empty() {
            return Ok(());
        }

        let frame = encode_frame(batch.ops())?;
        let mut backend = self.backend.lock();
        let start = backend.size()?;
        if let Err(err) = Self::append_frame(&mut backend, &frame, self.config.sync_on_commit) {
            if let Err(rollback) = backend.truncate(start) {
                warn!(error = %rollback, offset = start, "failed to roll back partial frame");
            }
            return Err(err);
        }

        let ops = batch.len();
        let mut tables = self.tables.write();
        for op in batch.into_ops() {
            tables.apply(op);
        }
        self.frames.fetch_add(1, Ordering::AcqRel);
        debug!(ops, offset = start, bytes = frame.len(), "batch committed");
        Ok(())
    }

    fn meta_get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_access()?;
        Ok(self.tables.read().meta_get(namespace, key).cloned())
    }

    fn meta_scan(&self, namespace: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.check_access()?;
        Ok(self.tables.read().meta_scan(namespace))
    }

    fn stats(&self) -> StorageResult<StoreStats> {
        self.check_access()?;
        let log_bytes = self.backend.lock().size()?;
        let tables = self.tables.read();
        Ok(StoreStats {
            records: tables.counts(),
            metadata: tables.meta_namespaces(),
            log_bytes,
            frames: self.frames.load(Ordering::Acquire),
        })
    }

    fn check_access(&self) -> StorageResult<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        if self.config.thread_confined && thread::current().id() != self.owner {
            return Err(StorageError::WrongThread {
                owner: format!("{:?}", self.owner),
            });
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("storage adapter closed");
        }
    }
}

/// Outcome of [`LogAdapter::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Frames before compaction.
    pub frames_before: u64,
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction.
    pub bytes_after: u64,
}

/// Outcome of checking a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogReport {
    /// Complete frames.
    pub frames: u64,
    /// Operations across all frames.
    pub operations: u64,
    /// Bytes covered by complete frames.
    pub valid_bytes: u64,
    /// Incomplete bytes after the last frame.
    pub torn_bytes: u64,
}

/// Checks every frame of a log without applying it.
pub fn verify_log<B: LogBackend + ?Sized>(backend: &B) -> StorageResult<LogReport> {
    let scan = frame::scan(&backend.read_all()?)?;
    Ok(LogReport {
        frames: scan.frames.len() as u64,
        operations: scan.frames.iter().map(|ops| ops.len() as u64).sum(),
        valid_bytes: scan.valid_len,
        torn_bytes: scan.torn_bytes,
    })
}
