use std::collections::HashMap;
use std::path::PathBuf;

use crate::core::{DataType, EntityKind, Record, Result, StoreError, Value};

/// Declared field of an entity kind.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub data_type: DataType,
    pub required: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.required {
                return Err(StoreError::ValidationFailed(format!(
                    "Field '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }
        if !self.data_type.is_compatible(value) {
            return Err(StoreError::TypeMismatch(format!(
                "Field '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }
        Ok(())
    }
}

/// Declared entity kind. Fields not declared here are accepted untyped.
#[derive(Debug, Clone)]
pub struct EntityDef {
    kind: EntityKind,
    fields: Vec<FieldDef>,
}

impl EntityDef {
    pub fn new(kind: impl Into<EntityKind>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validates a single field value against its declaration, if any.
    /// Undeclared fields are accepted untyped.
    pub fn validate_value(&self, field: &str, value: &Value) -> Result<()> {
        match self.field_def(field) {
            Some(def) => def.validate(value),
            None => Ok(()),
        }
    }

    /// Validates a record against this definition. With `complete` set,
    /// required fields must be present (insert); otherwise only the fields
    /// the record carries are checked (update).
    pub fn validate(&self, record: &Record, complete: bool) -> Result<()> {
        for (name, value) in record.fields() {
            if let Some(def) = self.field_def(name) {
                def.validate(value)?;
            }
        }
        if complete {
            for def in &self.fields {
                if def.required && record.get(&def.name).is_none() {
                    return Err(StoreError::ValidationFailed(format!(
                        "Required field '{}' missing on '{}'",
                        def.name, self.kind
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The set of entity kinds a store accepts.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: HashMap<EntityKind, EntityDef>,
}

impl Schema {
    pub fn new(entities: Vec<EntityDef>) -> Self {
        Self {
            entities: entities
                .into_iter()
                .map(|def| (def.kind.clone(), def))
                .collect(),
        }
    }

    pub fn entity(&self, kind: &EntityKind) -> Option<&EntityDef> {
        self.entities.get(kind)
    }

    pub fn contains(&self, kind: &EntityKind) -> bool {
        self.entities.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &EntityKind> {
        self.entities.keys()
    }

    pub fn require(&self, kind: &EntityKind) -> Result<&EntityDef> {
        self.entity(kind)
            .ok_or_else(|| StoreError::KindNotFound(kind.as_str().to_string()))
    }
}

/// Snapshot durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Snapshot written inline during apply; persistence failures reject the
    /// commit.
    Sync,
    /// Snapshot handed to a background persister thread; persistence
    /// failures are logged, never surfaced to the committing context.
    #[default]
    Async,
    /// Memory-only.
    None,
}

/// Construction parameters for a store coordinator.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub schema: Schema,
    pub path: Option<PathBuf>,
    pub durability: DurabilityMode,
}

impl StoreConfig {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            path: None,
            durability: DurabilityMode::default(),
        }
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }
}
