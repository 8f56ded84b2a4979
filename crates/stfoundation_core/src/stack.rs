//! Persistence stack wiring.
//!
//! # Responsibility
//! - Turn a `ConfigProvider` into store descriptors, a schema, the local
//!   store, the sync mirror and the settings store.
//! - Hand out loaders bound to the main or a background context.
//!
//! # Invariants
//! - Store initialization failure is fatal through `load`.
//! - Mirror options are attached only while an account is linked and the
//!   config enables mirroring.

use crate::config::ConfigProvider;
use crate::mirror::{configure, DirectoryRemoteDatabase, MemoryRemoteDatabase, MirrorError, RemoteDatabase, SyncMirror};
use crate::model::entity::ManagedEntity;
use crate::model::schema::{Schema, SchemaError};
use crate::repo::RecordLoader;
use crate::settings::{SettingsError, SettingsStore};
use crate::store::{LocalStore, StoreDescriptor, StoreError, StoreLocation};
use log::{error, info};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

pub struct PersistenceStack {
    config: Arc<dyn ConfigProvider>,
    store: LocalStore,
    mirror: SyncMirror,
    settings: SettingsStore,
}

impl PersistenceStack {
    /// Loads the stack with the remote database chosen by `config`.
    ///
    /// # Panics
    /// When the schema resource or a store file cannot be loaded. Use
    /// [`PersistenceStack::try_load_with_remote`] to handle failures.
    pub async fn load(config: Arc<dyn ConfigProvider>) -> Self {
        let remote = remote_database(config.as_ref());
        Self::load_with_remote(config, remote).await
    }

    /// Like [`PersistenceStack::load`] with an explicit remote database.
    pub async fn load_with_remote(config: Arc<dyn ConfigProvider>, remote: Arc<dyn RemoteDatabase>) -> Self {
        match Self::try_load_with_remote(config, remote).await {
            Ok(stack) => stack,
            Err(err) => {
                error!("event=stack_load module=stack status=fatal error={err}");
                panic!("unresolved error loading persistence stack: {err}");
            }
        }
    }

    pub async fn try_load_with_remote(
        config: Arc<dyn ConfigProvider>,
        remote: Arc<dyn RemoteDatabase>,
    ) -> Result<Self, StackError> {
        let started_at = Instant::now();
        let schema = Schema::load(config.model_dir(), config.store_container_name())?;

        let linked = match remote.has_account().await {
            Ok(linked) => linked,
            Err(err) => {
                info!("event=stack_load module=stack status=offline error={err}");
                false
            }
        };
        let mirrored = linked && config.use_remote_mirror();
        let descriptors = store_descriptors(config.as_ref(), mirrored);

        let store = LocalStore::try_open(descriptors, schema)?;
        let mirror = SyncMirror::new(store.clone(), remote, mirrored);
        let settings = SettingsStore::open(config.settings_path())?;

        info!(
            "event=stack_load module=stack status=ok container={} mirrored={} duration_ms={}",
            config.store_container_name(),
            mirrored,
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            config,
            store,
            mirror,
            settings,
        })
    }

    pub fn config(&self) -> &dyn ConfigProvider {
        self.config.as_ref()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn mirror(&self) -> &SyncMirror {
        &self.mirror
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Loader bound to the shared main context.
    pub fn loader<E: ManagedEntity>(&self) -> RecordLoader<E> {
        RecordLoader::new(self.store.main_context())
    }

    /// Loader bound to a fresh background context.
    pub fn background_loader<E: ManagedEntity>(&self) -> RecordLoader<E> {
        RecordLoader::new(self.store.background_context())
    }

    /// Re-evaluates mirroring after account or config changes.
    pub async fn reinitiate(&self) -> bool {
        self.mirror.reinitiate(self.config.as_ref()).await
    }
}

/// Private and shared descriptors for `config`.
///
/// The shared descriptor copies the private one, so it is mirrored exactly
/// when the private one is.
pub fn store_descriptors(config: &dyn ConfigProvider, mirrored: bool) -> Vec<StoreDescriptor> {
    let private = configure(
        StoreDescriptor::private(StoreLocation::File(config.private_store_path())),
        config.remote_container_id(),
        mirrored,
    );
    let shared = private.shared_copy(StoreLocation::File(config.shared_store_path()));
    vec![private, shared]
}

/// Directory-backed remote when configured, otherwise an in-process one.
pub fn remote_database(config: &dyn ConfigProvider) -> Arc<dyn RemoteDatabase> {
    match config.remote_directory() {
        Some(root) => Arc::new(DirectoryRemoteDatabase::new(root, config.remote_container_id())),
        None => Arc::new(MemoryRemoteDatabase::new(config.remote_container_id())),
    }
}

#[cfg(test)]
mod tests {
    use super::store_descriptors;
    use crate::config::StoreConfig;
    use crate::store::{StoreLocation, StoreScope};
    use std::path::PathBuf;

    fn config() -> StoreConfig {
        StoreConfig {
            use_remote_mirror: true,
            store_container_name: "Budget".to_string(),
            app_bundle_id: "com.example.budget".to_string(),
            app_group_id: "group.budget".to_string(),
            remote_container_id: "iCloud.budget".to_string(),
            group_container_root: PathBuf::from("/containers"),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn descriptors_follow_the_file_layout() {
        let descriptors = store_descriptors(&config(), true);
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].scope, StoreScope::Private);
        assert_eq!(
            descriptors[1].location,
            StoreLocation::File(PathBuf::from("/containers/group.budget/Budget.shared.sqlite"))
        );
        assert!(descriptors.iter().all(|descriptor| descriptor.is_mirrored()));
        assert!(descriptors.iter().all(|descriptor| descriptor.history_tracking));
    }

    #[test]
    fn unlinked_accounts_get_no_mirror_options() {
        let descriptors = store_descriptors(&config(), false);
        assert!(descriptors.iter().all(|descriptor| !descriptor.is_mirrored()));
    }
}
