//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure the SQLite connection backing a local store.
//! - Attach the shared store file to the same connection.
//! - Apply schema migrations in deterministic order per attached schema.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA <schema>.user_version`.
//! - Store code must not read/write records before migrations succeed.

use thiserror::Error;

pub mod migrations;
mod open;

pub use open::{attach_db, open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    #[error("failed to prepare store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid schema alias `{0}`")]
    InvalidAlias(String),
}
