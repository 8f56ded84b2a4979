//! Store configuration supplied by the host application.
//!
//! # Responsibility
//! - Define the `ConfigProvider` contract read by the persistence stack.
//! - Provide `StoreConfig`, a serde-backed provider loaded from JSON.
//! - Derive the on-disk layout from identifiers.
//!
//! # Invariants
//! - Store files live under `<group_container_root>/<app_group_id>/`.
//! - The shared store sits next to the private one as `<name>.shared.sqlite`.

use crate::store::{store_path, SHARED_STORE_SUFFIX};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Values the persistence stack needs from its host.
pub trait ConfigProvider: Send + Sync {
    fn use_remote_mirror(&self) -> bool;

    /// Model and store file base name.
    fn store_container_name(&self) -> &str;

    fn app_bundle_id(&self) -> &str;

    fn app_group_id(&self) -> &str;

    fn remote_container_id(&self) -> &str;

    /// Directory holding one sub-directory per application group.
    fn group_container_root(&self) -> &Path;

    /// Directory holding `<store_container_name>.model.json`.
    fn model_dir(&self) -> &Path;

    /// Mounted remote container root, when a directory mirror is used.
    fn remote_directory(&self) -> Option<&Path> {
        None
    }

    fn group_dir(&self) -> PathBuf {
        self.group_container_root().join(self.app_group_id())
    }

    fn private_store_path(&self) -> PathBuf {
        store_path(self.group_dir(), self.store_container_name())
    }

    fn shared_store_path(&self) -> PathBuf {
        store_path(
            self.group_dir(),
            &format!("{}{SHARED_STORE_SUFFIX}", self.store_container_name()),
        )
    }

    fn settings_path(&self) -> PathBuf {
        store_path(self.group_dir(), &format!("{}.settings", self.app_bundle_id()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub use_remote_mirror: bool,
    pub store_container_name: String,
    pub app_bundle_id: String,
    pub app_group_id: String,
    pub remote_container_id: String,
    pub group_container_root: PathBuf,
    pub model_dir: PathBuf,
    pub remote_directory: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            use_remote_mirror: false,
            store_container_name: String::new(),
            app_bundle_id: String::new(),
            app_group_id: String::new(),
            remote_container_id: String::new(),
            group_container_root: PathBuf::from("."),
            model_dir: PathBuf::from("."),
            remote_directory: None,
        }
    }
}

impl StoreConfig {
    /// Loads and validates a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_container_name.trim().is_empty() {
            return Err(ConfigError::MissingField("store_container_name"));
        }
        if self.app_bundle_id.trim().is_empty() {
            return Err(ConfigError::MissingField("app_bundle_id"));
        }
        if self.app_group_id.trim().is_empty() {
            return Err(ConfigError::MissingField("app_group_id"));
        }
        if self.use_remote_mirror && self.remote_container_id.trim().is_empty() {
            return Err(ConfigError::MissingField("remote_container_id"));
        }
        for (field, value) in [
            ("store_container_name", &self.store_container_name),
            ("app_bundle_id", &self.app_bundle_id),
            ("app_group_id", &self.app_group_id),
        ] {
            if value.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "{field} must not contain path separators, got `{value}`"
                )));
            }
        }
        Ok(())
    }
}

impl ConfigProvider for StoreConfig {
    fn use_remote_mirror(&self) -> bool {
        self.use_remote_mirror
    }

    fn store_container_name(&self) -> &str {
        &self.store_container_name
    }

    fn app_bundle_id(&self) -> &str {
        &self.app_bundle_id
    }

    fn app_group_id(&self) -> &str {
        &self.app_group_id
    }

    fn remote_container_id(&self) -> &str {
        &self.remote_container_id
    }

    fn group_container_root(&self) -> &Path {
        &self.group_container_root
    }

    fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn remote_directory(&self) -> Option<&Path> {
        self.remote_directory.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ConfigProvider, StoreConfig};
    use std::path::Path;

    const CONFIG: &str = r#"{
        "use_remote_mirror": true,
        "store_container_name": "Budget",
        "app_bundle_id": "com.example.budget",
        "app_group_id": "group.com.example.budget",
        "remote_container_id": "iCloud.com.example.budget",
        "group_container_root": "/var/containers"
    }"#;

    #[test]
    fn file_layout_follows_identifiers() {
        let config = StoreConfig::from_json_str(CONFIG).unwrap();
        assert_eq!(
            config.private_store_path(),
            Path::new("/var/containers/group.com.example.budget/Budget.sqlite")
        );
        assert_eq!(
            config.shared_store_path(),
            Path::new("/var/containers/group.com.example.budget/Budget.shared.sqlite")
        );
        assert_eq!(
            config.settings_path(),
            Path::new("/var/containers/group.com.example.budget/com.example.budget.settings.sqlite")
        );
        assert_eq!(config.model_dir(), Path::new("."));
        assert!(config.remote_directory().is_none());
    }

    #[test]
    fn mirror_requires_a_container_id() {
        let err = StoreConfig::from_json_str(
            r#"{"use_remote_mirror": true, "store_container_name": "Budget",
                "app_bundle_id": "b", "app_group_id": "g"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("remote_container_id")));
    }

    #[test]
    fn path_separators_are_rejected() {
        let err = StoreConfig::from_json_str(
            r#"{"store_container_name": "../Budget", "app_bundle_id": "b", "app_group_id": "g"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_files_report_their_path() {
        let err = StoreConfig::from_file("/definitely/missing/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
