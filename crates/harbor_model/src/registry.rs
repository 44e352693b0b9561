//! Immutable registry of model schemas.

use crate::error::{ModelError, ModelResult};
use crate::schema::{Association, ModelSchema};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The set of models known to a store.
///
/// Built once with [`ModelRegistry::builder`] and shared read-only; there is
/// no API to mutate a registry after it is built.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ModelSchema>>,
}

impl ModelRegistry {
    /// Starts building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            models: Vec::new(),
        }
    }

    /// Looks up a model schema by name.
    pub fn get(&self, name: &str) -> ModelResult<&Arc<ModelSchema>> {
        self.models
            .get(name)
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))
    }

    /// Returns true if the model is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// All registered schemas, ordered by name.
    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelSchema>> {
        self.models.values()
    }

    /// Names of models that are replicated to the remote service.
    pub fn synced_models(&self) -> Vec<String> {
        self.models
            .values()
            .filter(|m| m.sync_enabled())
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Has-many relationships (on any parent) whose children are `child`.
    ///
    /// Returns `(parent schema, association)` pairs.
    pub fn parents_of<'a>(
        &'a self,
        child: &'a str,
    ) -> impl Iterator<Item = (&'a Arc<ModelSchema>, &'a Association)> + 'a {
        self.models.values().flat_map(move |parent| {
            parent
                .has_many()
                .filter(move |a| a.target() == child)
                .map(move |a| (parent, a))
        })
    }
}

/// Builder for [`ModelRegistry`].
#[derive(Debug)]
pub struct RegistryBuilder {
    models: Vec<ModelSchema>,
}

impl RegistryBuilder {
    /// Adds a model schema.
    pub fn register(mut self, schema: ModelSchema) -> Self {
        self.models.push(schema);
        self
    }

    /// Validates cross-model references and freezes the registry.
    pub fn build(self) -> ModelResult<Arc<ModelRegistry>> {
        let mut models = BTreeMap::new();
        for schema in self.models {
            let name = schema.name().to_string();
            if models.insert(name.clone(), Arc::new(schema)).is_some() {
                return Err(ModelError::invalid_schema(format!(
                    "model {name} registered twice"
                )));
            }
        }

        for schema in models.values() {
            for assoc in schema.associations() {
                let target = models.get(assoc.target()).ok_or_else(|| {
                    ModelError::invalid_schema(format!(
                        "association {}.{} targets unknown model {}",
                        schema.name(),
                        assoc.name(),
                        assoc.target()
                    ))
                })?;

                match assoc {
                    Association::BelongsTo { target_names, .. } => {
                        if target_names.len() != target.primary_key().len() {
                            return Err(ModelError::invalid_schema(format!(
                                "belongs-to {}.{} has {} key fields but {} has a {}-part key",
                                schema.name(),
                                assoc.name(),
                                target_names.len(),
                                target.name(),
                                target.primary_key().len()
                            )));
                        }
                    }
                    Association::HasMany {
                        associated_with, ..
                    } => {
                        if associated_with.len() != schema.primary_key().len() {
                            return Err(ModelError::invalid_schema(format!(
                                "has-many {}.{} has {} key fields but {} has a {}-part key",
                                schema.name(),
                                assoc.name(),
                                associated_with.len(),
                                schema.name(),
                                schema.primary_key().len()
                            )));
                        }
                        for fk in associated_with {
                            if target.field(fk).is_none() {
                                return Err(ModelError::UnknownField {
                                    model: target.name().to_string(),
                                    field: fk.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(Arc::new(ModelRegistry { models }))
    }
}
