//! Adapter configuration.

/// Configuration for opening a [`crate::LogAdapter`].
///
/// ```
/// use harbor_storage::AdapterConfig;
///
/// let config = AdapterConfig::default()
///     .with_sync_on_commit(false)
///     .with_thread_confined(true);
/// assert!(config.create_if_missing);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Create the store directory when it does not exist.
    pub create_if_missing: bool,
    /// `fsync` the log after every committed batch.
    pub sync_on_commit: bool,
    /// Only the thread that opened the adapter may use it.
    pub thread_confined: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            thread_confined: false,
        }
    }
}

impl AdapterConfig {
    /// Sets `create_if_missing`.
    #[must_use]
    pub const fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Sets `sync_on_commit`.
    #[must_use]
    pub const fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Sets `thread_confined`.
    #[must_use]
    pub const fn with_thread_confined(mut self, confined: bool) -> Self {
        self.thread_confined = confined;
        self
    }
}
