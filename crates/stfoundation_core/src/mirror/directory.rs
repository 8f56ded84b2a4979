//! Remote database backed by a mounted container directory.
//!
//! Layout under `<root>/<container_id>/`:
//! - `account.json`: the signed-in account.
//! - `<scope>/<owner>/<zone>/zone.json`: change counter, tombstones, share.
//! - `<scope>/<owner>/<zone>/records/<type>.<id>.json`: one file per record.
//!
//! The container is unreachable while `<root>` does not exist.

use super::remote::{RemoteDatabase, RemoteQuery, RemoteRecord, Share, ZoneChanges, ZoneId};
use super::{MirrorError, MirrorResult};
use crate::model::entity::EntityId;
use crate::store::StoreScope;
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const ACCOUNT_FILE: &str = "account.json";
const ZONE_FILE: &str = "zone.json";
const RECORDS_DIR: &str = "records";

#[derive(Debug, Serialize, Deserialize)]
struct Account {
    user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tombstone {
    record_type: String,
    id: EntityId,
    tag: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ZoneManifest {
    counter: u64,
    #[serde(default)]
    tombstones: Vec<Tombstone>,
    #[serde(default)]
    share: Option<Share>,
}

impl ZoneManifest {
    fn next_tag(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

pub struct DirectoryRemoteDatabase {
    root: PathBuf,
    container_id: String,
    // Serializes manifest read-modify-write cycles.
    lock: Mutex<()>,
}

impl DirectoryRemoteDatabase {
    pub fn new(root: impl Into<PathBuf>, container_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            container_id: container_id.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn container_dir(&self) -> PathBuf {
        self.root.join(&self.container_id)
    }

    /// Records `user` as the signed-in account.
    pub async fn sign_in(&self, user: &str) -> MirrorResult<()> {
        let _guard = self.lock.lock().await;
        self.ensure_reachable()?;
        write_json(
            &self.container_dir().join(ACCOUNT_FILE),
            &Account {
                user: user.to_string(),
            },
        )
        .await
    }

    pub async fn sign_out(&self) -> MirrorResult<()> {
        let _guard = self.lock.lock().await;
        let path = self.container_dir().join(ACCOUNT_FILE);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MirrorError::Io { path, source }),
        }
    }

    /// Attaches `share` to its zone, creating the zone when missing.
    pub async fn share_zone(&self, scope: StoreScope, share: Share) -> MirrorResult<()> {
        let _guard = self.lock.lock().await;
        self.account().await?;
        let zone_dir = self.zone_dir(scope, &share.zone)?;
        let mut manifest = read_json::<ZoneManifest>(&zone_dir.join(ZONE_FILE))
            .await?
            .unwrap_or_default();
        manifest.share = Some(share);
        write_json(&zone_dir.join(ZONE_FILE), &manifest).await
    }

    fn ensure_reachable(&self) -> MirrorResult<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(MirrorError::Unreachable(self.root.display().to_string()))
        }
    }

    async fn account(&self) -> MirrorResult<Account> {
        self.ensure_reachable()?;
        read_json::<Account>(&self.container_dir().join(ACCOUNT_FILE))
            .await?
            .ok_or(MirrorError::NoAccount)
    }

    fn scope_dir(&self, scope: StoreScope) -> PathBuf {
        self.container_dir().join(scope.as_str())
    }

    fn zone_dir(&self, scope: StoreScope, zone: &ZoneId) -> MirrorResult<PathBuf> {
        validate_name(&zone.owner)?;
        validate_name(&zone.name)?;
        Ok(self.scope_dir(scope).join(&zone.owner).join(&zone.name))
    }

    async fn list_zones(&self, scope: StoreScope) -> MirrorResult<Vec<ZoneId>> {
        let mut zones = Vec::new();
        for owner in list_dir(&self.scope_dir(scope)).await? {
            for name in list_dir(&self.scope_dir(scope).join(&owner)).await? {
                let zone = ZoneId::new(name, owner.clone());
                if fs::try_exists(self.zone_dir(scope, &zone)?.join(ZONE_FILE))
                    .await
                    .unwrap_or(false)
                {
                    zones.push(zone);
                }
            }
        }
        zones.sort();
        Ok(zones)
    }

    async fn load_records(&self, zone_dir: &Path) -> MirrorResult<Vec<RemoteRecord>> {
        let records_dir = zone_dir.join(RECORDS_DIR);
        let mut records = Vec::new();
        for file in list_dir(&records_dir).await? {
            if !file.ends_with(".json") {
                continue;
            }
            if let Some(record) = read_json::<RemoteRecord>(&records_dir.join(&file)).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn load_zone(&self, scope: StoreScope, zone: &ZoneId) -> MirrorResult<(PathBuf, ZoneManifest)> {
        let zone_dir = self.zone_dir(scope, zone)?;
        let manifest = read_json::<ZoneManifest>(&zone_dir.join(ZONE_FILE))
            .await?
            .ok_or_else(|| MirrorError::ZoneNotFound(zone.key()))?;
        Ok((zone_dir, manifest))
    }
}

#[async_trait]
impl RemoteDatabase for DirectoryRemoteDatabase {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn has_account(&self) -> MirrorResult<bool> {
        match self.account().await {
            Ok(_) => Ok(true),
            Err(MirrorError::NoAccount) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn current_user(&self) -> MirrorResult<String> {
        Ok(self.account().await?.user)
    }

    async fn all_zones(&self, scope: StoreScope) -> MirrorResult<Vec<ZoneId>> {
        let _guard = self.lock.lock().await;
        self.account().await?;
        self.list_zones(scope).await
    }

    async fn delete_zone(&self, scope: StoreScope, zone: &ZoneId) -> MirrorResult<()> {
        let _guard = self.lock.lock().await;
        self.account().await?;
        let (zone_dir, _) = self.load_zone(scope, zone).await?;
        fs::remove_dir_all(&zone_dir)
            .await
            .map_err(|source| MirrorError::Io {
                path: zone_dir.clone(),
                source,
            })?;
        debug!(
            "event=remote_zone_delete module=mirror status=ok scope={} zone={}",
            scope.as_str(),
            zone
        );
        Ok(())
    }

    async fn query(&self, scope: StoreScope, query: &RemoteQuery) -> MirrorResult<Vec<RemoteRecord>> {
        let _guard = self.lock.lock().await;
        self.account().await?;
        let mut hits = Vec::new();
        for zone in self.list_zones(scope).await? {
            let zone_dir = self.zone_dir(scope, &zone)?;
            hits.extend(
                self.load_records(&zone_dir)
                    .await?
                    .into_iter()
                    .filter(|record| query.matches(record)),
            );
        }
        Ok(hits)
    }

    async fn save(&self, scope: StoreScope, records: Vec<RemoteRecord>) -> MirrorResult<Vec<RemoteRecord>> {
        let _guard = self.lock.lock().await;
        self.account().await?;

        let mut saved = Vec::with_capacity(records.len());
        for mut record in records {
            validate_name(&record.record_type)?;
            let zone_dir = self.zone_dir(scope, &record.zone)?;
            let manifest_path = zone_dir.join(ZONE_FILE);
            let mut manifest = read_json::<ZoneManifest>(&manifest_path)
                .await?
                .unwrap_or_default();

            record.change_tag = manifest.next_tag();
            manifest
                .tombstones
                .retain(|tombstone| !(tombstone.record_type == record.record_type && tombstone.id == record.id));
            write_json(&record_path(&zone_dir, &record.record_type, record.id), &record).await?;
            write_json(&manifest_path, &manifest).await?;
            saved.push(record);
        }
        Ok(saved)
    }

    async fn delete_records(
        &self,
        scope: StoreScope,
        zone: &ZoneId,
        records: &[(String, EntityId)],
    ) -> MirrorResult<usize> {
        let _guard = self.lock.lock().await;
        self.account().await?;
        let (zone_dir, mut manifest) = match self.load_zone(scope, zone).await {
            Ok(loaded) => loaded,
            Err(MirrorError::ZoneNotFound(_)) => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        for (record_type, id) in records {
            validate_name(record_type)?;
            let path = record_path(&zone_dir, record_type, *id);
            match fs::remove_file(&path).await {
                Ok(()) => {
                    let tag = manifest.next_tag();
                    manifest.tombstones.push(Tombstone {
                        record_type: record_type.clone(),
                        id: *id,
                        tag,
                    });
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(MirrorError::Io { path, source }),
            }
        }
        if removed > 0 {
            write_json(&zone_dir.join(ZONE_FILE), &manifest).await?;
        }
        Ok(removed)
    }

    async fn fetch_share(&self, scope: StoreScope, zone: &ZoneId) -> MirrorResult<Option<Share>> {
        let _guard = self.lock.lock().await;
        self.account().await?;
        let (_, manifest) = self.load_zone(scope, zone).await?;
        Ok(manifest.share)
    }

    async fn fetch_zone_changes(
        &self,
        scope: StoreScope,
        zone: &ZoneId,
        since: Option<u64>,
    ) -> MirrorResult<ZoneChanges> {
        let _guard = self.lock.lock().await;
        self.account().await?;
        let (zone_dir, manifest) = self.load_zone(scope, zone).await?;

        let since = since.unwrap_or(0);
        let mut changed: Vec<RemoteRecord> = self
            .load_records(&zone_dir)
            .await?
            .into_iter()
            .filter(|record| record.change_tag > since)
            .collect();
        changed.sort_by_key(|record| record.change_tag);

        Ok(ZoneChanges {
            changed,
            deleted: manifest
                .tombstones
                .iter()
                .filter(|tombstone| tombstone.tag > since)
                .map(|tombstone| (tombstone.record_type.clone(), tombstone.id))
                .collect(),
            token: manifest.counter,
        })
    }
}

fn record_path(zone_dir: &Path, record_type: &str, id: EntityId) -> PathBuf {
    zone_dir
        .join(RECORDS_DIR)
        .join(format!("{record_type}.{id}.json"))
}

fn validate_name(name: &str) -> MirrorResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(MirrorError::InvalidName(name.to_string()))
    }
}

/// Names of the entries in `dir`; empty when it does not exist.
async fn list_dir(dir: &Path) -> MirrorResult<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(MirrorError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| MirrorError::Io {
        path: dir.to_path_buf(),
        source,
    })? {
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> MirrorResult<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(MirrorError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes through a temporary sibling so readers never see partial files.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> MirrorResult<()> {
    let io_error = |source: std::io::Error| MirrorError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, bytes).await.map_err(io_error)?;
    fs::rename(&staging, path).await.map_err(io_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::DirectoryRemoteDatabase;
    use crate::mirror::remote::{ParticipantRole, RemoteDatabase, RemoteRecord, Share, ZoneId};
    use crate::mirror::MirrorError;
    use crate::model::entity::Attributes;
    use crate::store::StoreScope;
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn record(zone: ZoneId, title: &str) -> RemoteRecord {
        let mut attributes = Attributes::new();
        attributes.insert("title".to_string(), json!(title));
        RemoteRecord {
            record_type: "Trip".to_string(),
            id: Uuid::new_v4(),
            zone,
            attributes,
            version: 1,
            change_tag: 0,
        }
    }

    #[tokio::test]
    async fn missing_root_is_unreachable() {
        let temp = TempDir::new().unwrap();
        let database = DirectoryRemoteDatabase::new(temp.path().join("unmounted"), "iCloud.test");
        assert!(matches!(
            database.has_account().await,
            Err(MirrorError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn records_persist_across_instances() {
        let temp = TempDir::new().unwrap();
        let database = DirectoryRemoteDatabase::new(temp.path(), "iCloud.test");
        assert!(!database.has_account().await.unwrap());
        database.sign_in("alice").await.unwrap();

        let zone = ZoneId::mirror("alice");
        let saved = database
            .save(StoreScope::Private, vec![record(zone.clone(), "Lisbon")])
            .await
            .unwrap();
        assert_eq!(saved[0].change_tag, 1);

        let reopened = DirectoryRemoteDatabase::new(temp.path(), "iCloud.test");
        assert_eq!(reopened.current_user().await.unwrap(), "alice");
        assert_eq!(reopened.all_zones(StoreScope::Private).await.unwrap(), vec![zone.clone()]);

        let changes = reopened
            .fetch_zone_changes(StoreScope::Private, &zone, None)
            .await
            .unwrap();
        assert_eq!(changes.changed, saved);
        assert_eq!(changes.token, 1);

        reopened.delete_zone(StoreScope::Private, &zone).await.unwrap();
        assert!(reopened.all_zones(StoreScope::Private).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shares_are_stored_in_the_zone_manifest() {
        let temp = TempDir::new().unwrap();
        let database = DirectoryRemoteDatabase::new(temp.path(), "iCloud.test");
        database.sign_in("bob").await.unwrap();

        let zone = ZoneId::new("trip", "alice");
        let share = Share::new(zone.clone()).with_participant("bob", ParticipantRole::PrivateUser);
        database.share_zone(StoreScope::Shared, share.clone()).await.unwrap();

        assert_eq!(
            database.fetch_share(StoreScope::Shared, &zone).await.unwrap(),
            Some(share)
        );
        let err = database
            .fetch_share(StoreScope::Shared, &ZoneId::new("../escape", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidName(_)));
    }
}
