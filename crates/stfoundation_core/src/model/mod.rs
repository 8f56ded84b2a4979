//! Persistence model shared by the store, loader and mirror.
//!
//! # Responsibility
//! - Define the entity contract and the record snapshot stored on disk.
//! - Define object identifiers, the logical schema and query predicates.
//!
//! # Invariants
//! - Every record is identified by `(entity name, EntityId)` inside one store.
//! - Attributes are an opaque JSON object; only top-level keys are inspected.

pub mod entity;
pub mod object_id;
pub mod predicate;
pub mod schema;
