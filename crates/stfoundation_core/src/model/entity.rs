//! Entity contract and stored record snapshots.
//!
//! # Responsibility
//! - Describe what a type must provide to be managed by a `Context`.
//! - Convert entities to and from their JSON attribute objects.
//!
//! # Invariants
//! - `ManagedEntity::id` is stable for the lifetime of the record.
//! - An entity serializes to a JSON object, never a scalar or array.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Stable identifier of one record inside its entity kind.
pub type EntityId = Uuid;

/// JSON attribute object persisted for one record.
pub type Attributes = Map<String, Value>;

/// A typed record kind known to the store schema.
///
/// Implementors are plain values. A value only becomes "live" once a
/// `Context` has registered it through a fetch or an insert.
pub trait ManagedEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Entity name as declared in the schema.
    const ENTITY_NAME: &'static str;

    /// Stable record identifier.
    fn id(&self) -> EntityId;
}

/// Attribute snapshot of one stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub entity: String,
    pub id: EntityId,
    pub attributes: Attributes,
    /// Incremented on every committed write; used by the merge policy.
    pub version: i64,
    /// Remote zone the record belongs to, when known.
    pub zone: Option<String>,
}

impl Record {
    /// Builds an unsaved record snapshot for `entity`.
    pub fn from_entity<E: ManagedEntity>(entity: &E) -> serde_json::Result<Self> {
        Ok(Self {
            entity: E::ENTITY_NAME.to_string(),
            id: entity.id(),
            attributes: to_attributes(entity)?,
            version: 0,
            zone: None,
        })
    }

    /// Decodes the attribute object back into a typed entity.
    pub fn decode<E: ManagedEntity>(&self) -> serde_json::Result<E> {
        serde_json::from_value(Value::Object(self.attributes.clone()))
    }
}

/// Serializes an entity into its attribute object.
pub fn to_attributes<E: ManagedEntity>(entity: &E) -> serde_json::Result<Attributes> {
    match serde_json::to_value(entity)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "entity `{}` must serialize to a JSON object, got {}",
            E::ENTITY_NAME,
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::{ManagedEntity, Record};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Budget {
        id: Uuid,
        title: String,
        limit: i64,
    }

    impl ManagedEntity for Budget {
        const ENTITY_NAME: &'static str = "Budget";

        fn id(&self) -> Uuid {
            self.id
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Scalar(Uuid);

    impl ManagedEntity for Scalar {
        const ENTITY_NAME: &'static str = "Scalar";

        fn id(&self) -> Uuid {
            self.0
        }
    }

    #[test]
    fn record_snapshot_decodes_back_to_entity() {
        let budget = Budget {
            id: Uuid::new_v4(),
            title: "groceries".to_string(),
            limit: 250,
        };

        let record = Record::from_entity(&budget).expect("budget should serialize");
        assert_eq!(record.entity, "Budget");
        assert_eq!(record.id, budget.id);
        assert_eq!(record.attributes["limit"], 250);

        let decoded: Budget = record.decode().expect("record should decode");
        assert_eq!(decoded, budget);
    }

    #[test]
    fn non_object_entities_are_rejected() {
        let err = Record::from_entity(&Scalar(Uuid::new_v4())).expect_err("scalar must fail");
        assert!(err.to_string().contains("JSON object"));
    }
}
