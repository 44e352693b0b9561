//! In-memory materialization of the log.

use crate::batch::WriteOp;
use harbor_model::{ModelKey, Predicate, Record};
use std::collections::BTreeMap;

/// Records per model and metadata per namespace, as of the last applied
/// frame.
#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    records: BTreeMap<String, BTreeMap<ModelKey, Record>>,
    meta: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl Tables {
    pub(crate) fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Put { key, record } => {
                self.records
                    .entry(record.model().to_string())
                    .or_default()
                    .insert(key, record);
            }
            WriteOp::Delete { model, key } => {
                if let Some(table) = self.records.get_mut(&model) {
                    table.remove(&key);
                    if table.is_empty() {
                        self.records.remove(&model);
                    }
                }
            }
            WriteOp::PutMeta {
                namespace,
                key,
                value,
            } => {
                self.meta.entry(namespace).or_default().insert(key, value);
            }
            WriteOp::DeleteMeta { namespace, key } => {
                if let Some(ns) = self.meta.get_mut(&namespace) {
                    ns.remove(&key);
                    if ns.is_empty() {
                        self.meta.remove(&namespace);
                    }
                }
            }
            WriteOp::Clear => {
                self.records.clear();
                self.meta.clear();
            }
        }
    }

    pub(crate) fn get(&self, model: &str, key: &ModelKey) -> Option<&Record> {
        self.records.get(model).and_then(|t| t.get(key))
    }

    pub(crate) fn scan<'a>(
        &'a self,
        model: &str,
        predicate: Option<&'a Predicate>,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        self.records
            .get(model)
            .into_iter()
            .flat_map(|t| t.values())
            .filter(move |r| predicate.map_or(true, |p| p.evaluate(r)))
    }

    pub(crate) fn meta_get(&self, namespace: &str, key: &str) -> Option<&Vec<u8>> {
        self.meta.get(namespace).and_then(|ns| ns.get(key))
    }

    pub(crate) fn meta_scan(&self, namespace: &str) -> Vec<(String, Vec<u8>)> {
        self.meta
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub(crate) fn counts(&self) -> BTreeMap<String, usize> {
        self.records
            .iter()
            .map(|(model, t)| (model.clone(), t.len()))
            .collect()
    }

    pub(crate) fn meta_namespaces(&self) -> BTreeMap<String, usize> {
        self.meta
            .iter()
            .map(|(ns, entries)| (ns.clone(), entries.len()))
            .collect()
    }

    /// Operations that rebuild these tables from nothing.
    pub(crate) fn snapshot_ops(&self) -> Vec<WriteOp> {
        let mut ops = vec![WriteOp::Clear];
        for table in self.records.values() {
            for (key, record) in table {
                ops.push(WriteOp::Put {
                    key: key.clone(),
                    record: record.clone(),
                });
            }
        }
        for (namespace, entries) in &self.meta {
            for (key, value) in entries {
                ops.push(WriteOp::PutMeta {
                    namespace: namespace.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        ops
    }
}
