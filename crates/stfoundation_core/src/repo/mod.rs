//! Typed record access over unit-of-work contexts.
//!
//! # Responsibility
//! - Define the generic CRUD contract used by application features.
//! - Map store failures onto loader semantics (`NotFound`,
//!   `InvalidIdentifier`, `OperationFailed`).
//!
//! # Invariants
//! - Every failure is logged through the persistence sink before it is
//!   returned.
//! - Writes save their context only when it has pending changes.

pub mod loader;

pub use loader::{Loader, LoaderError, LoaderResult, RecordLoader};
