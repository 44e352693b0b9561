//! Error types for schema and record handling.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while building schemas or interpreting records against them.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    /// The model name is not registered.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// A field referenced by name does not exist on the model.
    #[error("unknown field {field} on model {model}")]
    UnknownField {
        /// Model name.
        model: String,
        /// Field name.
        field: String,
    },

    /// A required field is absent or null.
    #[error("missing required field {field} on model {model}")]
    MissingField {
        /// Model name.
        model: String,
        /// Field name.
        field: String,
    },

    /// A field value does not match its declared type.
    #[error("field {field} on model {model} expects {expected}, found {found}")]
    TypeMismatch {
        /// Model name.
        model: String,
        /// Field name.
        field: String,
        /// Declared type.
        expected: &'static str,
        /// Type of the supplied value.
        found: &'static str,
    },

    /// A relationship name is not declared on the model.
    #[error("unknown association {name} on model {model}")]
    UnknownAssociation {
        /// Model name.
        model: String,
        /// Association name.
        name: String,
    },

    /// A primary key could not be formed.
    #[error("invalid key for model {model}: {message}")]
    InvalidKey {
        /// Model name.
        model: String,
        /// Description of the problem.
        message: String,
    },

    /// The schema declaration is inconsistent.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// A record could not be encoded.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// A record could not be decoded.
    #[error("decoding failed: {0}")]
    Decoding(String),
}

impl ModelError {
    /// Creates an invalid key error.
    pub fn invalid_key(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidKey {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema(message.into())
    }
}
