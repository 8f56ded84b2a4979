//! Opaque object identifiers with a URI representation.
//!
//! An `ObjectId` names one record in one store file:
//! `x-stcoredata://<store-uuid>/<EntityName>/<record-uuid>`.

use crate::model::entity::EntityId;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

const URI_SCHEME: &str = "x-stcoredata";

static OBJECT_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^x-stcoredata://([0-9A-Fa-f-]{36})/([A-Za-z_][A-Za-z0-9_]*)/([0-9A-Fa-f-]{36})$",
    )
    .expect("object uri pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid object uri `{0}`")]
pub struct ObjectIdError(pub String);

/// Store-scoped identity of a managed record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    store: Uuid,
    entity: String,
    id: EntityId,
}

impl ObjectId {
    pub fn new(store: Uuid, entity: impl Into<String>, id: EntityId) -> Self {
        Self {
            store,
            entity: entity.into(),
            id,
        }
    }

    /// Parses the URI form produced by `uri_representation`.
    pub fn parse(uri: &str) -> Result<Self, ObjectIdError> {
        let captures = OBJECT_URI
            .captures(uri.trim())
            .ok_or_else(|| ObjectIdError(uri.to_string()))?;

        let store = Uuid::parse_str(&captures[1]).map_err(|_| ObjectIdError(uri.to_string()))?;
        let id = Uuid::parse_str(&captures[3]).map_err(|_| ObjectIdError(uri.to_string()))?;
        Ok(Self::new(store, &captures[2], id))
    }

    pub fn store(&self) -> Uuid {
        self.store
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Absolute string of the URI representation.
    pub fn uri_representation(&self) -> String {
        format!("{URI_SCHEME}://{}/{}/{}", self.store, self.entity, self.id)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri_representation())
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}
