//! Inspect command implementation.

use super::{format_size, open_existing};
use crate::Format;
use harbor_storage::StorageAdapter;
use harbor_sync::CURSOR_NAMESPACE;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Log size in bytes.
    pub log_bytes: u64,
    /// Frames in the log.
    pub frames: u64,
    /// Record count per model type.
    pub records: BTreeMap<String, usize>,
    /// Entry count per metadata namespace.
    pub metadata: BTreeMap<String, usize>,
    /// Inbound cursor per model (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursors: Option<BTreeMap<String, u64>>,
}

/// Gathers the inspection result for the store at `path`.
pub fn collect(path: &Path, with_cursors: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let stats = store.stats()?;

    let cursors = if with_cursors {
        let mut cursors = BTreeMap::new();
        for (model, bytes) in store.meta_scan(CURSOR_NAMESPACE)? {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| format!("malformed cursor for {model}"))?;
            cursors.insert(model, u64::from_le_bytes(raw));
        }
        Some(cursors)
    } else {
        None
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        log_bytes: stats.log_bytes,
        frames: stats.frames,
        records: stats.records,
        metadata: stats.metadata,
        cursors,
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, cursors: bool, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(path, cursors)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("HarborDB Store Inspection");
    println!("=========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Log:");
    println!("  Size:   {}", format_size(result.log_bytes));
    println!("  Frames: {}", result.frames);
    println!();
    println!("Records:");
    if result.records.is_empty() {
        println!("  (none)");
    }
    for (model, count) in &result.records {
        println!("  {model:<20} {count}");
    }
    println!();
    println!("Metadata:");
    if result.metadata.is_empty() {
        println!("  (none)");
    }
    for (namespace, count) in &result.metadata {
        println!("  {namespace:<20} {count}");
    }

    if let Some(cursors) = &result.cursors {
        println!();
        println!("Sync cursors:");
        for (model, cursor) in cursors {
            println!("  {model:<20} {cursor}");
        }
    }
}
