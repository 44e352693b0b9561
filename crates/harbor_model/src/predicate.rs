//! Predicate expression trees.
//!
//! Predicates are plain data: leaf comparisons combined with AND/OR/NOT.
//! They can be serialized, inspected and evaluated by any storage adapter
//! through [`Predicate::evaluate`].
//!
//! ```
//! use harbor_model::{field, Record};
//!
//! let p = field("rating").ge(3).and(field("title").contains("rust"));
//! let r = Record::new("Post").with("rating", 4).with("title", "learning rust");
//! assert!(p.evaluate(&r));
//! ```

use crate::error::ModelResult;
use crate::key::ModelKey;
use crate::record::Record;
use crate::schema::ModelSchema;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operator of a leaf predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Substring match on text.
    Contains,
    /// Prefix match on text.
    BeginsWith,
}

/// A boolean expression over record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Matches every record.
    All,
    /// Field comparison leaf.
    Compare {
        /// Field name.
        field: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand operand.
        value: Value,
    },
    /// Inclusive range leaf.
    Between {
        /// Field name.
        field: String,
        /// Lower bound (inclusive).
        low: Value,
        /// Upper bound (inclusive).
        high: Value,
    },
    /// All children match. An empty list matches everything.
    And(Vec<Predicate>),
    /// Any child matches. An empty list matches nothing.
    Or(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
}

/// Starts a leaf predicate on `name`.
pub fn field(name: impl Into<String>) -> FieldRef {
    FieldRef { name: name.into() }
}

/// A field reference used to build leaf predicates.
#[derive(Debug, Clone)]
pub struct FieldRef {
    name: String,
}

impl FieldRef {
    fn compare(self, op: CompareOp, value: impl Into<Value>) -> Predicate {
        Predicate::Compare {
            field: self.name,
            op,
            value: value.into(),
        }
    }

    /// `field == value`
    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Eq, value)
    }

    /// `field != value`
    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Ne, value)
    }

    /// `field < value`
    pub fn lt(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Lt, value)
    }

    /// `field <= value`
    pub fn le(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Le, value)
    }

    /// `field > value`
    pub fn gt(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Gt, value)
    }

    /// `field >= value`
    pub fn ge(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Ge, value)
    }

    /// Text field contains `value`.
    pub fn contains(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Contains, value)
    }

    /// Text field starts with `value`.
    pub fn begins_with(self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::BeginsWith, value)
    }

    /// `low <= field <= high`
    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> Predicate {
        Predicate::Between {
            field: self.name,
            low: low.into(),
            high: high.into(),
        }
    }
}

impl Predicate {
    /// Conjunction, flattening nested ANDs.
    #[must_use]
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And(mut a), Predicate::And(b)) => {
                a.extend(b);
                Predicate::And(a)
            }
            (Predicate::And(mut a), p) => {
                a.push(p);
                Predicate::And(a)
            }
            (p, Predicate::And(mut b)) => {
                b.insert(0, p);
                Predicate::And(b)
            }
            (a, b) => Predicate::And(vec![a, b]),
        }
    }

    /// Disjunction, flattening nested ORs.
    #[must_use]
    pub fn or(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::Or(mut a), Predicate::Or(b)) => {
                a.extend(b);
                Predicate::Or(a)
            }
            (Predicate::Or(mut a), p) => {
                a.push(p);
                Predicate::Or(a)
            }
            (a, b) => Predicate::Or(vec![a, b]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Predicate {
        match self {
            Predicate::Not(inner) => *inner,
            p => Predicate::Not(Box::new(p)),
        }
    }

    /// Equality on every primary-key component of `schema`.
    pub fn key_equals(schema: &ModelSchema, key: &ModelKey) -> ModelResult<Predicate> {
        Self::fields_equal(schema.primary_key(), key).ok_or_else(|| {
            crate::ModelError::invalid_key(
                schema.name(),
                format!(
                    "expected {} key components, got {}",
                    schema.primary_key().len(),
                    key.len()
                ),
            )
        })
    }

    /// Equality of each named field with the matching key component.
    ///
    /// Returns `None` when the arities differ.
    pub fn fields_equal(fields: &[String], key: &ModelKey) -> Option<Predicate> {
        if fields.len() != key.len() {
            return None;
        }
        let leaves: Vec<Predicate> = fields
            .iter()
            .zip(key.parts())
            .map(|(f, part)| field(f.clone()).eq(Value::from(part.clone())))
            .collect();
        Some(match leaves.len() {
            1 => leaves.into_iter().next().unwrap_or(Predicate::All),
            _ => Predicate::And(leaves),
        })
    }

    /// Evaluates the predicate against a record.
    pub fn evaluate(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Compare { field, op, value } => compare(record.get(field), *op, value),
            Predicate::Between { field, low, high } => {
                let v = record.get(field);
                matches!(
                    v.compare(low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(v.compare(high), Some(Ordering::Less | Ordering::Equal))
            }
            Predicate::And(children) => children.iter().all(|p| p.evaluate(record)),
            Predicate::Or(children) => children.iter().any(|p| p.evaluate(record)),
            Predicate::Not(inner) => !inner.evaluate(record),
        }
    }

    /// Names of all fields the predicate reads.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::All => {}
            Predicate::Compare { field, .. } | Predicate::Between { field, .. } => out.push(field),
            Predicate::And(children) | Predicate::Or(children) => {
                for c in children {
                    c.collect_fields(out);
                }
            }
            Predicate::Not(inner) => inner.collect_fields(out),
        }
    }
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> bool {
    match op {
        CompareOp::Eq => lhs.loosely_equals(rhs),
        CompareOp::Ne => !lhs.loosely_equals(rhs),
        CompareOp::Lt => lhs.compare(rhs) == Some(Ordering::Less),
        CompareOp::Le => matches!(lhs.compare(rhs), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => lhs.compare(rhs) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(
            lhs.compare(rhs),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Contains => match (lhs, rhs) {
            (Value::Text(haystack), Value::Text(needle)) => haystack.contains(needle.as_str()),
            _ => false,
        },
        CompareOp::BeginsWith => match (lhs, rhs) {
            (Value::Text(s), Value::Text(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
    }
}

impl std::ops::Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        self.negate()
    }
}
