//! Compact command implementation.

use super::{format_size, open_existing};
use harbor_storage::{CompactionReport, StorageAdapter};
use std::path::Path;
use tracing::info;

/// Compacts the store at `path`. With `dry_run` nothing is written and
/// `None` is returned.
pub fn compact(
    path: &Path,
    dry_run: bool,
) -> Result<Option<CompactionReport>, Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    if dry_run {
        return Ok(None);
    }
    let report = store.compact()?;
    info!(path = %path.display(), "store compacted");
    Ok(Some(report))
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting store at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
        let stats = open_existing(path)?.stats()?;
        println!();
        println!("  Frames:   {}", stats.frames);
        println!("  Log size: {}", format_size(stats.log_bytes));
        if stats.frames <= 1 {
            println!();
            println!("No compaction needed - log is already a single frame");
        }
        return Ok(());
    }
    println!();

    if let Some(report) = compact(path, false)? {
        println!("  Frames before: {}", report.frames_before);
        println!("  Size before:   {}", format_size(report.bytes_before));
        println!("  Size after:    {}", format_size(report.bytes_after));
        let saved = report.bytes_before.saturating_sub(report.bytes_after);
        println!(
            "  Space saved:   {} ({:.1}%)",
            format_size(saved),
            if report.bytes_before > 0 {
                saved as f64 / report.bytes_before as f64 * 100.0
            } else {
                0.0
            }
        );
        println!();
        println!("✓ Compaction complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_model::{ModelKey, Record};
    use harbor_storage::{AdapterConfig, FileStore, WriteBatch};
    use tempfile::tempdir;

    #[test]
    fn compaction_keeps_live_data_in_one_frame() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open_dir(dir.path(), AdapterConfig::default()).unwrap();
            for rating in 0..5i64 {
                let mut batch = WriteBatch::new();
                batch.put(
                    ModelKey::from("p1"),
                    Record::new("Post").with("id", "p1").with("rating", rating),
                );
                store.apply(batch).unwrap();
            }
        }

        assert!(compact(dir.path(), true).unwrap().is_none());
        let report = compact(dir.path(), false).unwrap().unwrap();
        assert_eq!(report.frames_before, 5);
        assert!(report.bytes_after < report.bytes_before);

        let store = open_existing(dir.path()).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.records.get("Post"), Some(&1));
    }
}
