//! # HarborDB Model
//!
//! Static model metadata and the typed data that flows through HarborDB.
//!
//! This crate provides:
//! - [`ModelSchema`] / [`ModelRegistry`] - immutable schema built once at startup
//! - [`Value`] and [`Record`] - typed field values and model instances
//! - [`ModelKey`] - single or composite primary keys compared as ordered tuples
//! - [`Predicate`] - a data-only boolean expression tree evaluated against records
//!
//! The registry is never mutated after [`RegistryBuilder::build`]; it is shared
//! behind an `Arc` by every other component.
//!
//! ## Example
//!
//! ```
//! use harbor_model::{field, ModelRegistry, ModelSchema, Record, ValueType};
//!
//! let post = ModelSchema::builder("Post")
//!     .field("id", ValueType::Id)
//!     .field("title", ValueType::Text)
//!     .build()
//!     .unwrap();
//! let registry = ModelRegistry::builder().register(post).build().unwrap();
//!
//! let record = Record::new("Post").with("id", "p1").with("title", "hello");
//! let schema = registry.get("Post").unwrap();
//! assert_eq!(record.key(schema).unwrap().to_string(), "p1");
//! assert!(field("title").begins_with("he").evaluate(&record));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod key;
mod predicate;
mod record;
mod registry;
mod schema;
mod value;

pub use error::{ModelError, ModelResult};
pub use key::{KeyValue, ModelKey};
pub use predicate::{field, CompareOp, FieldRef, Predicate};
pub use record::Record;
pub use registry::{ModelRegistry, RegistryBuilder};
pub use schema::{Association, DeleteRule, FieldDef, ModelSchema, SchemaBuilder, ValueType};
pub use value::Value;
