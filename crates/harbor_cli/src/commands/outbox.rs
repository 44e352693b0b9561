//! Outbox command implementation.

use super::open_existing;
use crate::Format;
use harbor_core::{MutationKind, Outbox, OutboxEntry};
use harbor_storage::StorageAdapter;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// One pending mutation as reported.
#[derive(Debug, Serialize)]
pub struct OutboxRow {
    /// Enqueue order.
    pub seq: u64,
    /// Model type.
    pub model: String,
    /// Rendered primary key.
    pub key: String,
    /// Mutation kind.
    pub kind: MutationKind,
    /// Expected remote version.
    pub version: u64,
    /// Failed send attempts.
    pub retry_count: u32,
    /// Encoded payload size.
    pub payload_bytes: usize,
}

impl From<&OutboxEntry> for OutboxRow {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            seq: entry.seq,
            model: entry.event.model.clone(),
            key: entry.event.key.to_string(),
            kind: entry.event.kind,
            version: entry.event.version,
            retry_count: entry.retry_count,
            payload_bytes: entry.event.payload.len(),
        }
    }
}

/// Reads the pending entries of the store at `path`, oldest first.
pub fn collect(
    path: &Path,
    model: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<OutboxRow>, Box<dyn std::error::Error>> {
    let store: Arc<dyn StorageAdapter> = Arc::new(open_existing(path)?);
    let outbox = Outbox::load(store)?;
    Ok(outbox
        .entries()
        .iter()
        .filter(|entry| model.map_or(true, |m| entry.event.model == m))
        .take(limit.unwrap_or(usize::MAX))
        .map(OutboxRow::from)
        .collect())
}

/// Runs the outbox command.
pub fn run(
    path: &Path,
    model: Option<&str>,
    limit: Option<usize>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let rows = collect(path, model, limit)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            if rows.is_empty() {
                println!("Outbox is empty");
                return Ok(());
            }
            println!(
                "{:>6}  {:<8} {:<16} {:<24} {:>7} {:>7} {:>9}",
                "seq", "kind", "model", "key", "version", "retries", "payload"
            );
            for row in &rows {
                println!(
                    "{:>6}  {:<8} {:<16} {:<24} {:>7} {:>7} {:>9}",
                    row.seq,
                    format!("{:?}", row.kind),
                    row.model,
                    row.key,
                    row.version,
                    row.retry_count,
                    row.payload_bytes
                );
            }
            println!();
            println!("{} pending mutation(s)", rows.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::{EngineConfig, StorageEngine};
    use harbor_model::{ModelRegistry, ModelSchema, Record, ValueType};
    use harbor_storage::{AdapterConfig, FileStore};
    use tempfile::tempdir;

    fn seed(path: &Path) {
        let registry = ModelRegistry::builder()
            .register(
                ModelSchema::builder("Post")
                    .field("id", ValueType::Id)
                    .build()
                    .unwrap(),
            )
            .register(
                ModelSchema::builder("Tag")
                    .field("id", ValueType::Id)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let store: Arc<dyn StorageAdapter> =
            Arc::new(FileStore::open_dir(path, AdapterConfig::default()).unwrap());
        let engine = StorageEngine::open(registry, store, EngineConfig::default()).unwrap();
        engine.save(Record::new("Post").with("id", "p1"), None).unwrap();
        engine.save(Record::new("Tag").with("id", "t1"), None).unwrap();
        engine.save(Record::new("Post").with("id", "p2"), None).unwrap();
    }

    #[test]
    fn lists_pending_entries_in_order() {
        let dir = tempdir().unwrap();
        seed(dir.path());

        let rows = collect(dir.path(), None, None).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(rows[0].kind, MutationKind::Create);
        assert_eq!(rows[0].key, "p1");

        let posts = collect(dir.path(), Some("Post"), Some(1)).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].model, "Post");
    }
}
