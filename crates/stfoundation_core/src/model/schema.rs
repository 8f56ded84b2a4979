//! Logical store schema loaded from a JSON model resource.
//!
//! # Responsibility
//! - Declare which entity kinds a store knows about.
//! - Locate and parse `<containerName>.model.json`.
//!
//! # Invariants
//! - Entity names are unique and valid identifiers.
//! - Attribute descriptions are carried for tooling only; the store does
//!   not enforce them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extension of a compiled model resource.
pub const MODEL_EXTENSION: &str = "model.json";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("model resource not found at `{0}`")]
    NotFound(PathBuf),
    #[error("failed to read model resource `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model resource: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid model: {0}")]
    Invalid(String),
}

/// Attribute storage hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    String,
    Integer,
    Double,
    Boolean,
    Date,
    Uuid,
    Binary,
    Transformable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
}

impl EntityDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.push(AttributeDescription {
            name: name.into(),
            kind,
            optional: false,
        });
        self
    }
}

/// Set of entity kinds managed by one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub entities: Vec<EntityDescription>,
}

fn default_schema_version() -> u32 {
    1
}

impl Schema {
    /// Builds and validates a schema in code.
    pub fn new(name: impl Into<String>, entities: Vec<EntityDescription>) -> Result<Self, SchemaError> {
        let schema = Self {
            name: name.into(),
            version: default_schema_version(),
            entities,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Returns the resource path for `container_name` inside `model_dir`.
    pub fn resource_path(model_dir: impl AsRef<Path>, container_name: &str) -> PathBuf {
        model_dir
            .as_ref()
            .join(format!("{container_name}.{MODEL_EXTENSION}"))
    }

    /// Locates and parses the model resource for `container_name`.
    pub fn load(model_dir: impl AsRef<Path>, container_name: &str) -> Result<Self, SchemaError> {
        let path = Self::resource_path(model_dir, container_name);
        if !path.is_file() {
            return Err(SchemaError::NotFound(path));
        }

        let text = std::fs::read_to_string(&path).map_err(|source| SchemaError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        let schema: Self = serde_json::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Entity names in declaration order.
    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|entity| entity.name.as_str())
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.entities.iter().any(|description| description.name == entity)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.entities.is_empty() {
            return Err(SchemaError::Invalid(format!(
                "model `{}` declares no entities",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for entity in &self.entities {
            if !is_valid_entity_name(&entity.name) {
                return Err(SchemaError::Invalid(format!(
                    "entity name `{}` is not a valid identifier",
                    entity.name
                )));
            }
            if !seen.insert(entity.name.as_str()) {
                return Err(SchemaError::Invalid(format!(
                    "entity `{}` is declared twice",
                    entity.name
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_entity_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
