//! Model schema declarations.

use crate::error::{ModelError, ModelResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Declared type of a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// Identifier, stored as text.
    Id,
    /// UTF-8 text.
    Text,
    /// Signed integer.
    Integer,
    /// Floating point number (integers are accepted).
    Float,
    /// Boolean.
    Boolean,
    /// Milliseconds since the Unix epoch (integers are accepted).
    Timestamp,
}

impl ValueType {
    /// Returns true if `value` may be stored in a field of this type.
    ///
    /// Null is accepted by every type; requiredness is checked separately.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ValueType::Id | ValueType::Text, Value::Text(_))
                | (ValueType::Integer, Value::Integer(_))
                | (ValueType::Float, Value::Float(_) | Value::Integer(_))
                | (ValueType::Boolean, Value::Bool(_))
                | (ValueType::Timestamp, Value::Timestamp(_) | Value::Integer(_))
        )
    }

    /// Name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Id => "id",
            ValueType::Text => "text",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::Boolean => "boolean",
            ValueType::Timestamp => "timestamp",
        }
    }
}

/// A scalar field declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Declared type.
    pub value_type: ValueType,
    /// Whether a non-null value is required on save.
    pub required: bool,
}

/// What happens to has-many children when their parent is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeleteRule {
    /// Children are deleted together with the parent.
    #[default]
    Cascade,
    /// Children are left untouched.
    NoAction,
}

/// A relationship declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Association {
    /// Singular reference to a target model. The foreign key lives on this
    /// model in `target_names`, one field per target primary-key component.
    BelongsTo {
        /// Relationship field name.
        name: String,
        /// Target model name.
        target: String,
        /// Local foreign-key fields, in target primary-key order.
        target_names: Vec<String>,
    },
    /// Collection of child records whose foreign-key fields
    /// (`associated_with`) hold this model's primary key.
    HasMany {
        /// Relationship field name.
        name: String,
        /// Child model name.
        target: String,
        /// Foreign-key fields on the child, in this model's primary-key order.
        associated_with: Vec<String>,
        /// Behavior when the parent is deleted.
        on_delete: DeleteRule,
    },
}

impl Association {
    /// Relationship field name.
    pub fn name(&self) -> &str {
        match self {
            Association::BelongsTo { name, .. } | Association::HasMany { name, .. } => name,
        }
    }

    /// Related model name.
    pub fn target(&self) -> &str {
        match self {
            Association::BelongsTo { target, .. } | Association::HasMany { target, .. } => target,
        }
    }

    /// The foreign-key field names participating in this relationship.
    pub fn key_fields(&self) -> &[String] {
        match self {
            Association::BelongsTo { target_names, .. } => target_names,
            Association::HasMany {
                associated_with, ..
            } => associated_with,
        }
    }
}

/// Static metadata for one model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    name: String,
    fields: Vec<FieldDef>,
    primary_key: Vec<String>,
    associations: Vec<Association>,
    sync_enabled: bool,
}

impl ModelSchema {
    /// Starts a schema declaration for `name`.
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
            primary_key: None,
            associations: Vec::new(),
            sync_enabled: true,
        }
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared scalar fields.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Looks up a field declaration.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Ordered primary-key field names.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// Returns true if the primary key has more than one component.
    pub fn has_composite_key(&self) -> bool {
        self.primary_key.len() > 1
    }

    /// All declared relationships.
    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    /// Looks up a relationship by field name.
    pub fn association(&self, name: &str) -> ModelResult<&Association> {
        self.associations
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| ModelError::UnknownAssociation {
                model: self.name.clone(),
                name: name.to_string(),
            })
    }

    /// Has-many relationships declared on this model.
    pub fn has_many(&self) -> impl Iterator<Item = &Association> {
        self.associations
            .iter()
            .filter(|a| matches!(a, Association::HasMany { .. }))
    }

    /// Belongs-to relationships declared on this model.
    pub fn belongs_to(&self) -> impl Iterator<Item = &Association> {
        self.associations
            .iter()
            .filter(|a| matches!(a, Association::BelongsTo { .. }))
    }

    /// Whether this model is replicated to the remote service.
    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled
    }
}

/// Builder for [`ModelSchema`].
#[derive(Debug)]
pub struct SchemaBuilder {
    name: String,
    fields: Vec<FieldDef>,
    primary_key: Option<Vec<String>>,
    associations: Vec<Association>,
    sync_enabled: bool,
}

impl SchemaBuilder {
    /// Adds a required field.
    pub fn field(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            value_type,
            required: true,
        });
        self
    }

    /// Adds an optional field.
    pub fn optional(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            value_type,
            required: false,
        });
        self
    }

    /// Sets the primary key. Defaults to `["id"]`.
    pub fn primary_key(mut self, fields: &[&str]) -> Self {
        self.primary_key = Some(fields.iter().map(|f| (*f).to_string()).collect());
        self
    }

    /// Declares a belongs-to relationship backed by local foreign-key fields.
    pub fn belongs_to(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        target_names: &[&str],
    ) -> Self {
        self.associations.push(Association::BelongsTo {
            name: name.into(),
            target: target.into(),
            target_names: target_names.iter().map(|f| (*f).to_string()).collect(),
        });
        self
    }

    /// Declares a cascading has-many relationship.
    pub fn has_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        associated_with: &[&str],
    ) -> Self {
        self.has_many_with_rule(name, target, associated_with, DeleteRule::Cascade)
    }

    /// Declares a has-many relationship with an explicit delete rule.
    pub fn has_many_with_rule(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        associated_with: &[&str],
        on_delete: DeleteRule,
    ) -> Self {
        self.associations.push(Association::HasMany {
            name: name.into(),
            target: target.into(),
            associated_with: associated_with.iter().map(|f| (*f).to_string()).collect(),
            on_delete,
        });
        self
    }

    /// Excludes the model from replication.
    pub fn local_only(mut self) -> Self {
        self.sync_enabled = false;
        self
    }

    /// Validates and finishes the schema.
    ///
    /// Cross-model checks (targets exist, key arity) happen in
    /// [`crate::RegistryBuilder::build`].
    pub fn build(self) -> ModelResult<ModelSchema> {
        if self.name.is_empty() {
            return Err(ModelError::invalid_schema("model name must not be empty"));
        }

        let primary_key = self.primary_key.unwrap_or_else(|| vec!["id".to_string()]);
        if primary_key.is_empty() {
            return Err(ModelError::invalid_schema(format!(
                "model {} has an empty primary key",
                self.name
            )));
        }

        for (i, f) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|other| other.name == f.name) {
                return Err(ModelError::invalid_schema(format!(
                    "duplicate field {} on model {}",
                    f.name, self.name
                )));
            }
        }

        for pk in &primary_key {
            let def = self
                .fields
                .iter()
                .find(|f| &f.name == pk)
                .ok_or_else(|| ModelError::UnknownField {
                    model: self.name.clone(),
                    field: pk.clone(),
                })?;
            if matches!(def.value_type, ValueType::Float | ValueType::Boolean) {
                return Err(ModelError::invalid_schema(format!(
                    "primary key field {} on model {} must be an id, text, integer or timestamp",
                    pk, self.name
                )));
            }
        }

        for assoc in &self.associations {
            if let Association::BelongsTo { target_names, .. } = assoc {
                for fk in target_names {
                    if !self.fields.iter().any(|f| &f.name == fk) {
                        return Err(ModelError::UnknownField {
                            model: self.name.clone(),
                            field: fk.clone(),
                        });
                    }
                }
            }
        }

        Ok(ModelSchema {
            name: self.name,
            fields: self.fields,
            primary_key,
            associations: self.associations,
            sync_enabled: self.sync_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_primary_key_is_id() {
        let schema = ModelSchema::builder("Todo")
            .field("id", ValueType::Id)
            .build()
            .unwrap();
        assert_eq!(schema.primary_key(), &["id".to_string()]);
        assert!(!schema.has_composite_key());
    }

    #[test]
    fn primary_key_must_reference_fields() {
        let err = ModelSchema::builder("Todo")
            .field("id", ValueType::Id)
            .primary_key(&["id", "missing"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownField { .. }));
    }

    #[test]
    fn float_keys_are_rejected() {
        let err = ModelSchema::builder("Reading")
            .field("value", ValueType::Float)
            .primary_key(&["value"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidSchema(_)));
    }

    #[test]
    fn belongs_to_fields_must_exist() {
        let err = ModelSchema::builder("Comment")
            .field("id", ValueType::Id)
            .belongs_to("post", "Post", &["postID"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownField { .. }));
    }

    #[test]
    fn type_acceptance() {
        assert!(ValueType::Float.accepts(&Value::Integer(3)));
        assert!(ValueType::Timestamp.accepts(&Value::Integer(3)));
        assert!(!ValueType::Integer.accepts(&Value::Text("3".into())));
        assert!(ValueType::Boolean.accepts(&Value::Null));
    }

    #[test]
    fn association_lookup() {
        let schema = ModelSchema::builder("Post")
            .field("id", ValueType::Id)
            .has_many_with_rule("comments", "Comment", &["postID"], DeleteRule::NoAction)
            .build()
            .unwrap();
        let assoc = schema.association("comments").unwrap();
        assert_eq!(assoc.target(), "Comment");
        assert_eq!(assoc.key_fields(), &["postID".to_string()]);
        assert!(schema.association("author").is_err());
        assert_eq!(schema.has_many().count(), 1);
    }
}
