//! In-process remote database.
//!
//! Holds zones in memory and exposes switches for reachability and the
//! signed-in account so callers can exercise offline and signed-out paths.

use super::remote::{RemoteDatabase, RemoteQuery, RemoteRecord, Share, ZoneChanges, ZoneId};
use super::{MirrorError, MirrorResult};
use crate::model::entity::EntityId;
use crate::store::StoreScope;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct ZoneState {
    records: BTreeMap<(String, EntityId), RemoteRecord>,
    tombstones: Vec<(String, EntityId, u64)>,
    share: Option<Share>,
    counter: u64,
}

impl ZoneState {
    fn next_tag(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

#[derive(Debug)]
struct MemoryState {
    reachable: bool,
    account: Option<String>,
    private: BTreeMap<ZoneId, ZoneState>,
    shared: BTreeMap<ZoneId, ZoneState>,
}

impl MemoryState {
    fn database(&mut self, scope: StoreScope) -> &mut BTreeMap<ZoneId, ZoneState> {
        match scope {
            StoreScope::Private => &mut self.private,
            StoreScope::Shared => &mut self.shared,
        }
    }

    fn database_ref(&self, scope: StoreScope) -> &BTreeMap<ZoneId, ZoneState> {
        match scope {
            StoreScope::Private => &self.private,
            StoreScope::Shared => &self.shared,
        }
    }
}

pub struct MemoryRemoteDatabase {
    container_id: String,
    state: RwLock<MemoryState>,
}

impl MemoryRemoteDatabase {
    /// Reachable database with no signed-in account.
    pub fn new(container_id: impl Into<String>) -> Self {
        Self::with_account(container_id, None)
    }

    /// Reachable database with `user` signed in.
    pub fn signed_in(container_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self::with_account(container_id, Some(user.into()))
    }

    fn with_account(container_id: impl Into<String>, account: Option<String>) -> Self {
        Self {
            container_id: container_id.into(),
            state: RwLock::new(MemoryState {
                reachable: true,
                account,
                private: BTreeMap::new(),
                shared: BTreeMap::new(),
            }),
        }
    }

    pub async fn sign_in(&self, user: impl Into<String>) {
        self.state.write().await.account = Some(user.into());
    }

    pub async fn sign_out(&self) {
        self.state.write().await.account = None;
    }

    pub async fn set_reachable(&self, reachable: bool) {
        self.state.write().await.reachable = reachable;
    }

    /// Attaches `share` to its zone, creating the zone when missing.
    pub async fn share_zone(&self, scope: StoreScope, share: Share) {
        let zone = share.zone.clone();
        let mut state = self.state.write().await;
        state
            .database(scope)
            .entry(zone)
            .or_default()
            .share = Some(share);
    }

    /// Number of records held across all zones of `scope`.
    pub async fn record_count(&self, scope: StoreScope) -> usize {
        let state = self.state.read().await;
        state
            .database_ref(scope)
            .values()
            .map(|zone| zone.records.len())
            .sum()
    }

    fn ensure_usable(&self, state: &MemoryState) -> MirrorResult<()> {
        if !state.reachable {
            return Err(MirrorError::Unreachable(self.container_id.clone()));
        }
        if state.account.is_none() {
            return Err(MirrorError::NoAccount);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteDatabase for MemoryRemoteDatabase {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    async fn has_account(&self) -> MirrorResult<bool> {
        let state = self.state.read().await;
        if !state.reachable {
            return Err(MirrorError::Unreachable(self.container_id.clone()));
        }
        Ok(state.account.is_some())
    }

    async fn current_user(&self) -> MirrorResult<String> {
        let state = self.state.read().await;
        self.ensure_usable(&state)?;
        state.account.clone().ok_or(MirrorError::NoAccount)
    }

    async fn all_zones(&self, scope: StoreScope) -> MirrorResult<Vec<ZoneId>> {
        let state = self.state.read().await;
        self.ensure_usable(&state)?;
        Ok(state.database_ref(scope).keys().cloned().collect())
    }

    async fn delete_zone(&self, scope: StoreScope, zone: &ZoneId) -> MirrorResult<()> {
        let mut state = self.state.write().await;
        self.ensure_usable(&state)?;
        state
            .database(scope)
            .remove(zone)
            .map(|_| ())
            .ok_or_else(|| MirrorError::ZoneNotFound(zone.key()))
    }

    async fn query(&self, scope: StoreScope, query: &RemoteQuery) -> MirrorResult<Vec<RemoteRecord>> {
        let state = self.state.read().await;
        self.ensure_usable(&state)?;
        Ok(state
            .database_ref(scope)
            .values()
            .flat_map(|zone| zone.records.values())
            .filter(|record| query.matches(record))
            .cloned()
            .collect())
    }

    async fn save(&self, scope: StoreScope, records: Vec<RemoteRecord>) -> MirrorResult<Vec<RemoteRecord>> {
        let mut state = self.state.write().await;
        self.ensure_usable(&state)?;
        let database = state.database(scope);

        let mut saved = Vec::with_capacity(records.len());
        for mut record in records {
            let zone = database.entry(record.zone.clone()).or_default();
            record.change_tag = zone.next_tag();
            let key = (record.record_type.clone(), record.id);
            zone.tombstones
                .retain(|(record_type, id, _)| (record_type, id) != (&key.0, &key.1));
            zone.records.insert(key, record.clone());
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
        let mut state = self.state.write().await;
        self.ensure_usable(&state)?;
        let Some(zone_state) = state.database(scope).get_mut(zone) else {
            return Ok(0);
        };

        let mut removed = 0;
        for (record_type, id) in records {
            if zone_state.records.remove(&(record_type.clone(), *id)).is_some() {
                let tag = zone_state.next_tag();
                zone_state.tombstones.push((record_type.clone(), *id, tag));
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn fetch_share(&self, scope: StoreScope, zone: &ZoneId) -> MirrorResult<Option<Share>> {
        let state = self.state.read().await;
        self.ensure_usable(&state)?;
        let zone_state = state
            .database_ref(scope)
            .get(zone)
            .ok_or_else(|| MirrorError::ZoneNotFound(zone.key()))?;
        Ok(zone_state.share.clone())
    }

    async fn fetch_zone_changes(
        &self,
        scope: StoreScope,
        zone: &ZoneId,
        since: Option<u64>,
    ) -> MirrorResult<ZoneChanges> {
        let state = self.state.read().await;
        self.ensure_usable(&state)?;
        let zone_state = state
            .database_ref(scope)
            .get(zone)
            .ok_or_else(|| MirrorError::ZoneNotFound(zone.key()))?;

        let since = since.unwrap_or(0);
        Ok(ZoneChanges {
            changed: zone_state
                .records
                .values()
                .filter(|record| record.change_tag > since)
                .cloned()
                .collect(),
            deleted: zone_state
                .tombstones
                .iter()
                .filter(|(_, _, tag)| *tag > since)
                .map(|(record_type, id, _)| (record_type.clone(), *id))
                .collect(),
            token: zone_state.counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryRemoteDatabase;
    use crate::mirror::remote::{RemoteDatabase, RemoteQuery, RemoteRecord, ZoneId};
    use crate::mirror::MirrorError;
    use crate::model::entity::Attributes;
    use crate::model::predicate::Predicate;
    use crate::store::StoreScope;
    use serde_json::json;
    use uuid::Uuid;

    fn remote_record(name: &str) -> RemoteRecord {
        let mut attributes = Attributes::new();
        attributes.insert("name".to_string(), json!(name));
        RemoteRecord {
            record_type: "User".to_string(),
            id: Uuid::new_v4(),
            zone: ZoneId::mirror("alice"),
            attributes,
            version: 1,
            change_tag: 0,
        }
    }

    #[tokio::test]
    async fn signed_out_databases_refuse_data_access() {
        let database = MemoryRemoteDatabase::new("iCloud.test");
        assert!(!database.has_account().await.unwrap());
        let err = database.all_zones(StoreScope::Private).await.unwrap_err();
        assert!(matches!(err, MirrorError::NoAccount));

        database.set_reachable(false).await;
        assert!(matches!(
            database.has_account().await,
            Err(MirrorError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn zone_changes_follow_tokens() {
        let database = MemoryRemoteDatabase::signed_in("iCloud.test", "alice");
        let zone = ZoneId::mirror("alice");
        let first = remote_record("ada");
        let second = remote_record("grace");

        database
            .save(StoreScope::Private, vec![first.clone()])
            .await
            .unwrap();
        let changes = database
            .fetch_zone_changes(StoreScope::Private, &zone, None)
            .await
            .unwrap();
        assert_eq!(changes.changed.len(), 1);
        let token = changes.token;

        database
            .save(StoreScope::Private, vec![second.clone()])
            .await
            .unwrap();
        database
            .delete_records(StoreScope::Private, &zone, &[("User".to_string(), first.id)])
            .await
            .unwrap();

        let changes = database
            .fetch_zone_changes(StoreScope::Private, &zone, Some(token))
            .await
            .unwrap();
        assert_eq!(changes.changed.len(), 1);
        assert_eq!(changes.changed[0].id, second.id);
        assert_eq!(changes.deleted, vec![("User".to_string(), first.id)]);

        let hits = database
            .query(StoreScope::Private, &RemoteQuery::new("User", Predicate::eq("name", "grace")))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
