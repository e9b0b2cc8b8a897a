use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::{EntityKind, RecordId, Value};

/// A single persisted entity instance.
///
/// A record carries a stable [`RecordId`], an [`EntityKind`] fixed at
/// creation, and a mutable set of typed fields. Records obtained from a
/// context are working copies; mutations become durable only when the
/// owning context commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    kind: EntityKind,
    fields: HashMap<String, Value>,
}

impl Record {
    pub(crate) fn new(kind: EntityKind) -> Self {
        Self {
            id: RecordId::new(),
            kind,
            fields: HashMap::new(),
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets a field, returning the previous value if there was one.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn unset(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn fields(&self) -> &HashMap<String, Value> {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_identity_survives_mutation() {
        let mut record = Record::new(EntityKind::new("Note"));
        let id = record.id();
        record.set("title", "hello");
        record.set("title", "world");
        assert_eq!(record.id(), id);
        assert_eq!(record.kind().as_str(), "Note");
    }

    #[test]
    fn test_set_returns_old_value() {
        let mut record = Record::new(EntityKind::new("Note"));
        assert_eq!(record.set("title", "first"), None);
        assert_eq!(record.set("title", "second"), Some(Value::from("first")));
        assert_eq!(record.get("title"), Some(&Value::from("second")));
    }

    #[test]
    fn test_unset_removes_field() {
        let mut record = Record::new(EntityKind::new("Note"));
        record.set("title", "x");
        assert_eq!(record.unset("title"), Some(Value::from("x")));
        assert_eq!(record.get("title"), None);
    }
}
