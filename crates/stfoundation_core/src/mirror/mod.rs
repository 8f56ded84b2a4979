//! Optional remote mirror of the local store.
//!
//! # Responsibility
//! - Decide whether mirroring is active from account state and config.
//! - Push local change history to remote zones and pull remote changes.
//! - Answer remote existence, purge, and share/ownership questions.
//!
//! # Invariants
//! - Mirroring is active only while an account is linked and the config
//!   enables it.
//! - Remote-origin writes are never pushed back.
//! - `purge_remote` always resets the local store, even when a remote
//!   deletion fails.

use crate::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

mod directory;
mod memory;
mod remote;
mod sync_mirror;

pub use directory::DirectoryRemoteDatabase;
pub use memory::MemoryRemoteDatabase;
pub use remote::{
    Participant, ParticipantRole, RemoteDatabase, RemoteQuery, RemoteRecord, Share, ZoneChanges,
    ZoneId, MIRROR_ZONE_NAME,
};
pub use sync_mirror::{configure, SyncMirror};

pub type MirrorResult<T> = Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("remote database is unreachable: {0}")]
    Unreachable(String),
    #[error("no remote account is signed in on this device")]
    NoAccount,
    #[error("remote zone not found: {0}")]
    ZoneNotFound(String),
    #[error("remote record not found: {0}")]
    RecordNotFound(String),
    #[error("object is not registered in the given context")]
    NotRegistered,
    #[error("invalid remote name `{0}`")]
    InvalidName(String),
    #[error("remote io error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("remote serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}
