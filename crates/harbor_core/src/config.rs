//! Engine configuration.

/// Configuration for a [`crate::StorageEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Events buffered per bus subscriber before new ones are dropped for it.
    pub event_buffer_capacity: usize,
    /// Largest serialized record accepted in a mutation event.
    pub max_payload_bytes: usize,
    /// Follow `DeleteRule::Cascade` associations on delete.
    pub cascade_deletes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer_capacity: 1024,
            max_payload_bytes: 4 * 1024 * 1024, // 4 MB
            cascade_deletes: true,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-subscriber buffer.
    #[must_use]
    pub const fn with_event_buffer_capacity(mut self, capacity: usize) -> Self {
        self.event_buffer_capacity = capacity;
        self
    }

    /// Sets the payload limit.
    #[must_use]
    pub const fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Enables or disables cascading deletes.
    #[must_use]
    pub const fn with_cascade_deletes(mut self, cascade: bool) -> Self {
        self.cascade_deletes = cascade;
        self
    }
}
