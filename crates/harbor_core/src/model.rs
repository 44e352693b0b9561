//! Loaded model instances.

use crate::engine::{EngineInner, StorageEngine};
use crate::error::{CoreError, CoreResult};
use crate::lazy::{Identifier, LazyList, LazyReference};
use harbor_model::{
    Association, ModelError, ModelKey, ModelRegistry, ModelSchema, Record, Value,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// A relationship field of a loaded model.
#[derive(Debug)]
pub enum Relation {
    /// Belongs-to.
    Reference(LazyReference),
    /// Has-many.
    List(LazyList),
}

/// A record returned by the engine, with its relationships as lazy proxies.
///
/// Models are detached values: editing one changes nothing until it is
/// passed back to [`StorageEngine::save`].
pub struct Model {
    record: Record,
    key: ModelKey,
    schema: Arc<ModelSchema>,
    registry: Arc<ModelRegistry>,
    engine: Weak<EngineInner>,
    relations: BTreeMap<String, Relation>,
}

impl Model {
    pub(crate) fn load(
        engine: &StorageEngine,
        schema: Arc<ModelSchema>,
        record: Record,
    ) -> CoreResult<Self> {
        let key = record.key(&schema)?;
        let mut model = Self {
            record,
            key,
            schema,
            registry: Arc::clone(engine.registry()),
            engine: engine.downgrade(),
            relations: BTreeMap::new(),
        };
        model.relations = model.build_relations()?;
        Ok(model)
    }

    fn build_relations(&self) -> CoreResult<BTreeMap<String, Relation>> {
        let mut relations = BTreeMap::new();
        for association in self.schema.associations() {
            let target = Arc::clone(self.registry.get(association.target())?);
            let relation = match association {
                Association::BelongsTo { target_names, .. } => {
                    let identifiers = self.record.key_from_fields(target_names).map(|fk| {
                        target
                            .primary_key()
                            .iter()
                            .zip(fk.parts())
                            .map(|(name, value)| Identifier {
                                name: name.clone(),
                                value: value.clone(),
                            })
                            .collect()
                    });
                    Relation::Reference(LazyReference::new(
                        Weak::clone(&self.engine),
                        self.schema.name(),
                        self.key.clone(),
                        target,
                        identifiers,
                    ))
                }
                Association::HasMany {
                    associated_with, ..
                } => Relation::List(LazyList::new(
                    Weak::clone(&self.engine),
                    self.schema.name(),
                    self.key.clone(),
                    target,
                    associated_with.clone(),
                )),
            };
            relations.insert(association.name().to_string(), relation);
        }
        Ok(relations)
    }

    /// The underlying record.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Consumes the model, returning its record.
    pub fn into_record(self) -> Record {
        self.record
    }

    /// Primary key.
    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    /// Model schema.
    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    /// Reads a field. Absent fields read as null.
    pub fn get(&self, field: &str) -> &Value {
        self.record.get(field)
    }

    /// Sets a field locally. Relationships are rebuilt so that editing a
    /// foreign key is reflected by the matching reference.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> CoreResult<()> {
        if self.schema.field(field).is_none() {
            return Err(ModelError::UnknownField {
                model: self.schema.name().to_string(),
                field: field.to_string(),
            }
            .into());
        }
        self.record.set(field, value);
        self.refresh()
    }

    fn refresh(&mut self) -> CoreResult<()> {
        self.key = self.record.key(&self.schema)?;
        self.relations = self.build_relations()?;
        Ok(())
    }

    /// The belongs-to proxy named `name`.
    pub fn reference(&self, name: &str) -> CoreResult<&LazyReference> {
        match self.relation(name)? {
            Relation::Reference(reference) => Ok(reference),
            Relation::List(_) => Err(CoreError::invalid_operation(format!(
                "{}.{name} is a has-many association",
                self.schema.name()
            ))),
        }
    }

    /// The has-many proxy named `name`.
    pub fn list(&self, name: &str) -> CoreResult<&LazyList> {
        match self.relation(name)? {
            Relation::List(list) => Ok(list),
            Relation::Reference(_) => Err(CoreError::invalid_operation(format!(
                "{}.{name} is a belongs-to association",
                self.schema.name()
            ))),
        }
    }

    fn relation(&self, name: &str) -> CoreResult<&Relation> {
        self.relations.get(name).ok_or_else(|| {
            ModelError::UnknownAssociation {
                model: self.schema.name().to_string(),
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Points the belongs-to association `name` at `target`, or clears it.
    ///
    /// Only the foreign-key fields change; save the model to persist.
    pub fn set_reference(&mut self, name: &str, target: Option<&Record>) -> CoreResult<()> {
        let association = self.schema.association(name)?.clone();
        let Association::BelongsTo {
            target: target_model,
            target_names,
            ..
        } = association
        else {
            return Err(CoreError::invalid_operation(format!(
                "{}.{name} is a has-many association",
                self.schema.name()
            )));
        };

        match target {
            Some(record) => {
                let target_schema = self.registry.get(&target_model)?;
                let key = record.key(target_schema)?;
                for (field, part) in target_names.iter().zip(key.parts()) {
                    self.record.set(field.clone(), Value::from(part.clone()));
                }
            }
            None => {
                for field in &target_names {
                    self.record.set(field.clone(), Value::Null);
                }
            }
        }
        self.refresh()
    }
}

impl From<Model> for Record {
    fn from(model: Model) -> Self {
        model.record
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("record", &self.record)
            .field("relations", &self.relations)
            .finish_non_exhaustive()
    }
}
