//! Typed key-value settings persisted in SQLite.
//!
//! # Responsibility
//! - Store small JSON-encoded preference values by key.
//! - Fall back to caller defaults when a value is missing or undecodable.
//!
//! # Invariants
//! - Keys are non-empty and trimmed.
//! - Values are stored as JSON text; the reader decides the type.

use crate::logging::log_entry;
use log::{info, Level};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SETTINGS_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
);";

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings value error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid settings key `{0}`")]
    InvalidKey(String),
    #[error("settings connection lock poisoned")]
    LockPoisoned,
}

pub struct SettingsStore {
    conn: Mutex<Connection>,
}

impl SettingsStore {
    /// Opens (creating when missing) the settings file at `path`.
    pub fn open(path: impl AsRef<Path>) -> SettingsResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self::bootstrap(Connection::open(path)?)?;
        info!("event=settings_open module=settings status=ok mode=file");
        Ok(store)
    }

    pub fn open_in_memory() -> SettingsResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> SettingsResult<Self> {
        conn.execute_batch(SETTINGS_SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Returns the stored value for `key`, or `default` when it is missing
    /// or cannot be decoded as `T`.
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.try_get_setting(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(err) => {
                log_entry(Level::Warn, "SettingsStore", "Read setting", &[&key, &err]);
                default
            }
        }
    }

    /// Like `get_setting` but reports decode and storage failures.
    pub fn try_get_setting<T: DeserializeOwned>(&self, key: &str) -> SettingsResult<Option<T>> {
        let key = normalize_key(key)?;
        let raw = {
            let conn = self.conn.lock().map_err(|_| SettingsError::LockPoisoned)?;
            conn.query_row("SELECT value FROM settings WHERE key = ?1;", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
        };
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    pub fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> SettingsResult<()> {
        let key = normalize_key(key)?;
        let text = serde_json::to_string(value)?;
        let conn = self.conn.lock().map_err(|_| SettingsError::LockPoisoned)?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CAST(strftime('%s', 'now') AS INTEGER);",
            params![key, text],
        )?;
        Ok(())
    }

    /// Removes `key`; returns whether a value was stored.
    pub fn remove_setting(&self, key: &str) -> SettingsResult<bool> {
        let key = normalize_key(key)?;
        let conn = self.conn.lock().map_err(|_| SettingsError::LockPoisoned)?;
        let removed = conn.execute("DELETE FROM settings WHERE key = ?1;", [key])?;
        Ok(removed > 0)
    }

    pub fn keys(&self) -> SettingsResult<Vec<String>> {
        let conn = self.conn.lock().map_err(|_| SettingsError::LockPoisoned)?;
        let mut stmt = conn.prepare("SELECT key FROM settings ORDER BY key ASC;")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

fn normalize_key(key: &str) -> SettingsResult<&str> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(SettingsError::InvalidKey(key.to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::{SettingsError, SettingsStore};

    #[test]
    fn keys_are_trimmed_and_must_not_be_empty() {
        let settings = SettingsStore::open_in_memory().unwrap();
        settings.set_setting(" theme ", "dark").unwrap();
        assert_eq!(settings.get_setting("theme", String::new()), "dark");
        assert!(matches!(
            settings.set_setting("  ", &1),
            Err(SettingsError::InvalidKey(_))
        ));
        assert_eq!(settings.keys().unwrap(), vec!["theme".to_string()]);
    }

    #[test]
    fn try_get_reports_type_mismatches() {
        let settings = SettingsStore::open_in_memory().unwrap();
        settings.set_setting("launch_count", &3).unwrap();
        assert!(matches!(
            settings.try_get_setting::<bool>("launch_count"),
            Err(SettingsError::Serialization(_))
        ));
        assert!(!settings.get_setting("launch_count", false));
    }
}
