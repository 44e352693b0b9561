//! CLI command implementations.

pub mod compact;
pub mod inspect;
pub mod outbox;
pub mod verify;

use harbor_storage::{AdapterConfig, FileStore};
use std::path::Path;

/// Opens an existing store without creating anything.
pub fn open_existing(path: &Path) -> Result<FileStore, Box<dyn std::error::Error>> {
    let config = AdapterConfig::default().with_create_if_missing(false);
    Ok(FileStore::open_dir(path, config)?)
}

/// Renders a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
