//! Local persistence core: schema-described record stores, typed loaders,
//! an optional remote mirror and typed settings.

pub mod config;
pub mod db;
pub mod logging;
pub mod mirror;
pub mod model;
pub mod repo;
pub mod settings;
pub mod stack;
pub mod store;

pub use config::{ConfigError, ConfigProvider, StoreConfig};
pub use logging::{default_log_level, flush_logging, init_logging, log_entry, logging_status, LoggingError};
pub use mirror::{
    configure, DirectoryRemoteDatabase, MemoryRemoteDatabase, MirrorError, MirrorResult, RemoteDatabase,
    RemoteQuery, SyncMirror,
};
pub use model::entity::{Attributes, EntityId, ManagedEntity, Record};
pub use model::object_id::{ObjectId, ObjectIdError};
pub use model::predicate::{Comparison, Predicate};
pub use model::schema::{AttributeKind, EntityDescription, Schema, SchemaError};
pub use repo::{Loader, LoaderError, LoaderResult, RecordLoader};
pub use settings::{SettingsError, SettingsResult, SettingsStore};
pub use stack::{PersistenceStack, StackError};
pub use store::{
    ChangeNotification, ChangeSource, Context, FetchRequest, LocalStore, SortDescriptor, StoreDescriptor,
    StoreError, StoreLocation, StoreResult, StoreScope,
};

/// Minimal health-check API for host integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
