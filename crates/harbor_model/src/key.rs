//! Primary key types.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One component of a primary key.
///
/// Only identifiers/text and integers may participate in keys so that keys
/// are totally ordered and hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    /// Integer component.
    Integer(i64),
    /// Text or identifier component.
    Text(String),
}

impl KeyValue {
    /// Converts a field value into a key component.
    ///
    /// Returns `None` for null and for kinds that cannot form keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(n) | Value::Timestamp(n) => Some(KeyValue::Integer(*n)),
            Value::Text(s) => Some(KeyValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl From<KeyValue> for Value {
    fn from(k: KeyValue) -> Self {
        match k {
            KeyValue::Integer(n) => Value::Integer(n),
            KeyValue::Text(s) => Value::Text(s),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Text(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        KeyValue::Text(s)
    }
}

impl From<i64> for KeyValue {
    fn from(n: i64) -> Self {
        KeyValue::Integer(n)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Integer(n) => write!(f, "{n}"),
            KeyValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// The identity of a model instance: an ordered tuple of key components.
///
/// Single-field keys are a tuple of length one. Two keys are the same entity
/// exactly when their component tuples are equal, component by component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey(Vec<KeyValue>);

impl ModelKey {
    /// Creates a key from its ordered components.
    pub fn new(parts: Vec<KeyValue>) -> Self {
        Self(parts)
    }

    /// Creates a single-component key.
    pub fn single(part: impl Into<KeyValue>) -> Self {
        Self(vec![part.into()])
    }

    /// Returns the ordered components.
    pub fn parts(&self) -> &[KeyValue] {
        &self.0
    }

    /// Returns true if the key has more than one component.
    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ModelKey {
    fn from(s: &str) -> Self {
        Self::single(s)
    }
}

impl From<String> for ModelKey {
    fn from(s: String) -> Self {
        Self::single(s)
    }
}

/// Composite keys render as their components joined by `#`.
impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("#")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}
