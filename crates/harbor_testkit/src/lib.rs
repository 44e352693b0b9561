//! # HarborDB Testkit
//!
//! Test utilities for HarborDB.
//!
//! This crate provides:
//! - The blog fixture schema and record builders
//! - In-memory and temporary-directory engines
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use harbor_testkit::prelude::*;
//!
//! with_engine(|engine| {
//!     engine.save(post("p1", "hello"), None).unwrap();
//!     assert_eq!(engine.count("Post", None).unwrap(), 1);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
