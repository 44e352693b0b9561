//! Model instances.

use crate::error::{ModelError, ModelResult};
use crate::key::{KeyValue, ModelKey};
use crate::schema::ModelSchema;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed model instance.
///
/// Besides its fields a record carries two sync attributes:
/// - `version`: the last version acknowledged by the remote service
///   (0 for records that have never been synced)
/// - `last_changed_at`: milliseconds since the Unix epoch of the last commit
///
/// Relationship fields are not stored here; belongs-to relationships are
/// represented by their foreign-key fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    model: String,
    fields: BTreeMap<String, Value>,
    version: u64,
    last_changed_at: i64,
}

impl Record {
    /// Creates an empty record of the given model type.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fields: BTreeMap::new(),
            version: 0,
            last_changed_at: 0,
        }
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Model type name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Assigns a field. Assigning `Value::Null` keeps the field as explicit null.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Reads a field; absent fields read as null.
    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// All assigned fields.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Last remote-acknowledged version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Sets the remote-acknowledged version.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Commit timestamp in milliseconds.
    pub fn last_changed_at(&self) -> i64 {
        self.last_changed_at
    }

    /// Sets the commit timestamp.
    pub fn set_last_changed_at(&mut self, millis: i64) {
        self.last_changed_at = millis;
    }

    /// Extracts the primary key according to `schema`.
    pub fn key(&self, schema: &ModelSchema) -> ModelResult<ModelKey> {
        if schema.name() != self.model {
            return Err(ModelError::invalid_key(
                &self.model,
                format!("record is not a {}", schema.name()),
            ));
        }
        let mut parts = Vec::with_capacity(schema.primary_key().len());
        for name in schema.primary_key() {
            let part = KeyValue::from_value(self.get(name)).ok_or_else(|| {
                ModelError::invalid_key(
                    &self.model,
                    format!("key field {name} is null or not a key type"),
                )
            })?;
            parts.push(part);
        }
        Ok(ModelKey::new(parts))
    }

    /// Reads the given fields as a key tuple.
    ///
    /// Returns `None` if any of them is null, which is how an absent
    /// relationship is represented.
    pub fn key_from_fields(&self, fields: &[String]) -> Option<ModelKey> {
        fields
            .iter()
            .map(|f| KeyValue::from_value(self.get(f)))
            .collect::<Option<Vec<_>>>()
            .map(ModelKey::new)
    }

    /// Checks the record against its schema: known fields, declared types and
    /// required fields present.
    pub fn validate(&self, schema: &ModelSchema) -> ModelResult<()> {
        for (name, value) in &self.fields {
            let def = schema.field(name).ok_or_else(|| ModelError::UnknownField {
                model: self.model.clone(),
                field: name.clone(),
            })?;
            if !def.value_type.accepts(value) {
                return Err(ModelError::TypeMismatch {
                    model: self.model.clone(),
                    field: name.clone(),
                    expected: def.value_type.name(),
                    found: value.type_name(),
                });
            }
        }
        for def in schema.fields().iter().filter(|f| f.required) {
            if self.get(&def.name).is_null() {
                return Err(ModelError::MissingField {
                    model: self.model.clone(),
                    field: def.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Encodes the record as CBOR.
    pub fn encode(&self) -> ModelResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ModelError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a record from CBOR.
    pub fn decode(bytes: &[u8]) -> ModelResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ModelError::Decoding(e.to_string()))
    }
}
