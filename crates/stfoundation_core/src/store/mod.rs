//! Local record store: descriptors, contexts and the change feed.
//!
//! # Responsibility
//! - Own the private and shared store files behind one SQLite connection.
//! - Produce unit-of-work `Context`s and commit their pending changes.
//! - Record change history for the remote mirror.
//!
//! # Invariants
//! - A save is one SQLite transaction across every attached store.
//! - A context only commits when it has pending changes.
//! - Conflicting writes resolve with the store-trump merge policy.

use crate::db::DbError;
use crate::model::object_id::ObjectId;
use crate::model::schema::SchemaError;
use thiserror::Error;

mod context;
mod descriptor;
mod fetch;
mod local_store;
mod merge;

pub use context::Context;
pub use descriptor::{
    store_path, MirrorOptions, StoreDescriptor, StoreLocation, StoreScope, SHARED_STORE_SUFFIX,
};
pub use fetch::{FetchRequest, SortDescriptor};
pub use local_store::{ChangeNotification, ChangeSource, LocalStore};
pub use merge::merge_store_trump;

pub(crate) use local_store::{ChangeOp, RemoteChanges};

pub type StoreResult<T> = Result<T, StoreError>;

/// Store-level failures surfaced by contexts and the local store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("entity `{0}` is not declared in the store schema")]
    UnknownEntity(String),
    #[error("object is not registered in this context: {0}")]
    NotRegistered(String),
    #[error("object was deleted from the store: {0}")]
    ObjectDeleted(ObjectId),
    #[error("invalid store descriptors: {0}")]
    InvalidDescriptor(String),
    #[error("invalid persisted record data: {0}")]
    InvalidData(String),
    #[error("store connection lock poisoned")]
    LockPoisoned,
    #[error("store task failed: {0}")]
    Task(String),
}
