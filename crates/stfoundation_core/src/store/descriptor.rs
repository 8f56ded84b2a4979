//! Store descriptors and the on-disk file layout.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Database file extension used for every store.
const STORE_EXTENSION: &str = "sqlite";

/// Suffix appended to the container name for the shared store.
pub const SHARED_STORE_SUFFIX: &str = ".shared";

/// Which database a store mirrors to, and which attached schema it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreScope {
    /// Owner-only records.
    Private,
    /// Records in zones shared with other participants.
    Shared,
}

impl StoreScope {
    pub const ALL: [StoreScope; 2] = [StoreScope::Private, StoreScope::Shared];

    /// SQLite schema alias the store is attached under.
    pub(crate) fn schema(self) -> &'static str {
        match self {
            Self::Private => "main",
            Self::Shared => "shared",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreLocation {
    File(PathBuf),
    InMemory,
}

impl StoreLocation {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path.as_path()),
            Self::InMemory => None,
        }
    }
}

/// Remote mirroring options attached to a store descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorOptions {
    pub container_id: String,
    pub database_scope: StoreScope,
}

/// Immutable description of one store file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub location: StoreLocation,
    pub scope: StoreScope,
    pub mirror: Option<MirrorOptions>,
    pub history_tracking: bool,
    pub remote_change_notifications: bool,
}

impl StoreDescriptor {
    /// Private store with history tracking and remote change notifications on.
    pub fn private(location: StoreLocation) -> Self {
        Self {
            location,
            scope: StoreScope::Private,
            mirror: None,
            history_tracking: true,
            remote_change_notifications: true,
        }
    }

    /// Copies this descriptor for the shared store at `location`.
    ///
    /// Mirroring, when present, is re-scoped to the shared database.
    pub fn shared_copy(&self, location: StoreLocation) -> Self {
        Self {
            location,
            scope: StoreScope::Shared,
            mirror: self.mirror.as_ref().map(|options| MirrorOptions {
                container_id: options.container_id.clone(),
                database_scope: StoreScope::Shared,
            }),
            history_tracking: self.history_tracking,
            remote_change_notifications: self.remote_change_notifications,
        }
    }

    pub fn with_mirror(mut self, mirror: Option<MirrorOptions>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }
}

/// Returns `<group_dir>/<database_name>.sqlite`.
pub fn store_path(group_dir: impl AsRef<Path>, database_name: &str) -> PathBuf {
    group_dir
        .as_ref()
        .join(format!("{database_name}.{STORE_EXTENSION}"))
}
