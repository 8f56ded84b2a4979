use super::remote::{RemoteDatabase, RemoteQuery, RemoteRecord, Share, ZoneId};
use super::{MirrorError, MirrorResult};
use crate::config::ConfigProvider;
use crate::logging::log_entry;
use crate::model::entity::{EntityId, ManagedEntity};
use crate::store::{
    ChangeOp, ChangeSource, Context, LocalStore, MirrorOptions, RemoteChanges, StoreDescriptor, StoreScope,
};
use log::{debug, info, warn, Level};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Attaches mirror options for `remote_container_id` to `descriptor` when
/// `enabled`, and clears them otherwise.
pub fn configure(descriptor: StoreDescriptor, remote_container_id: &str, enabled: bool) -> StoreDescriptor {
    let mirror = enabled.then(|| MirrorOptions {
        container_id: remote_container_id.to_string(),
        database_scope: descriptor.scope,
    });
    descriptor.with_mirror(mirror)
}

struct MirrorInner {
    store: LocalStore,
    remote: Arc<dyn RemoteDatabase>,
    enabled: AtomicBool,
    // Push, pull and purge move the same cursors; run them one at a time.
    sync_lock: Mutex<()>,
}

/// Mirrors the local store into a remote database.
#[derive(Clone)]
pub struct SyncMirror {
    inner: Arc<MirrorInner>,
}

impl SyncMirror {
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteDatabase>, enabled: bool) -> Self {
        Self {
            inner: Arc::new(MirrorInner {
                store,
                remote,
                enabled: AtomicBool::new(enabled),
                sync_lock: Mutex::new(()),
            }),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteDatabase> {
        &self.inner.remote
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        info!(
            "event=mirror_toggle module=mirror status=ok enabled={} container={}",
            enabled,
            self.inner.remote.container_id()
        );
    }

    /// Whether account credentials are present on this device.
    pub async fn is_linked(&self) -> bool {
        match self.inner.remote.has_account().await {
            Ok(linked) => linked,
            Err(err) => {
                warn!("event=mirror_account module=mirror status=error error={err}");
                false
            }
        }
    }

    /// Re-evaluates mirroring from the account state and `config`.
    ///
    /// Returns whether mirroring is active afterwards.
    pub async fn reinitiate(&self, config: &dyn ConfigProvider) -> bool {
        let active = config.use_remote_mirror() && self.is_linked().await;
        self.set_enabled(active);
        active
    }

    /// Three-state existence check against the private remote database.
    ///
    /// `Some(true)` when a record matches, `None` when the query succeeded
    /// without a match, `Some(false)` when the query failed.
    pub async fn has_remote_records(&self, query: &RemoteQuery) -> Option<bool> {
        match self.inner.remote.query(StoreScope::Private, query).await {
            Ok(records) if !records.is_empty() => Some(true),
            Ok(_) => None,
            Err(err) => {
                log_entry(
                    Level::Error,
                    "SyncMirror::has_remote_records",
                    "Query remote records",
                    &[&query.record_type, &err],
                );
                Some(false)
            }
        }
    }

    /// Deletes every private remote zone, then resets the local store.
    ///
    /// The local reset runs even when a zone deletion fails; the first
    /// remote error is returned afterwards.
    pub async fn purge_remote(&self) -> MirrorResult<()> {
        let _guard = self.inner.sync_lock.lock().await;
        let started_at = Instant::now();

        let remote_result = self.delete_private_zones().await;
        match &remote_result {
            Ok(removed) => log_entry(
                Level::Info,
                "SyncMirror::purge_remote",
                "Remove remote zones",
                &[&format!("zones={removed}")],
            ),
            Err(err) => log_entry(Level::Error, "SyncMirror::purge_remote", "Remove remote zones", &[err]),
        }

        let local_result = self.inner.store.reset_all().await;
        let history_result = self.forget_history().await;
        info!(
            "event=mirror_purge module=mirror status={} duration_ms={}",
            if remote_result.is_ok() { "ok" } else { "partial" },
            started_at.elapsed().as_millis()
        );

        remote_result?;
        local_result?;
        history_result
    }

    /// Whether the entity lives in a shared zone or in a zone with a share.
    ///
    /// Lookup failures are logged and reported as `false`.
    pub async fn is_shared<E: ManagedEntity>(&self, context: &Context, entity: &E) -> bool {
        match self.share_of(context, entity).await {
            Ok((scope, share)) => scope == StoreScope::Shared || share.is_some(),
            Err(err) => {
                log_entry(Level::Error, "SyncMirror::is_shared", "Share lookup", &[&E::ENTITY_NAME, &err]);
                false
            }
        }
    }

    /// Whether the signed-in account owns the entity's zone.
    ///
    /// Unshared private records belong to this account. Lookup failures are
    /// logged and reported as `false`.
    pub async fn is_owner<E: ManagedEntity>(&self, context: &Context, entity: &E) -> bool {
        let result = match self.share_of(context, entity).await {
            Ok((scope, None)) => Ok(scope == StoreScope::Private),
            Ok((_, Some(share))) => self
                .inner
                .remote
                .current_user()
                .await
                .map(|user| share.owner().is_some_and(|owner| owner.user == user)),
            Err(err) => Err(err),
        };
        result.unwrap_or_else(|err| {
            log_entry(Level::Error, "SyncMirror::is_owner", "Share lookup", &[&E::ENTITY_NAME, &err]);
            false
        })
    }

    /// Exports local changes recorded since the last push.
    ///
    /// Returns the number of records saved or deleted remotely; `0` while
    /// mirroring is inactive.
    pub async fn push_pending(&self) -> MirrorResult<usize> {
        if !self.is_enabled() {
            debug!("event=mirror_push module=mirror status=skipped reason=disabled");
            return Ok(0);
        }
        let _guard = self.inner.sync_lock.lock().await;
        let started_at = Instant::now();
        let user = self.inner.remote.current_user().await?;
        let store = &self.inner.store;

        let mut pushed = 0usize;
        for scope in store.scopes() {
            let cursor = store.mirror_cursor(scope).await?;
            let (changes, last_seq) = store.pending_changes(scope, cursor).await?;

            let mut saves = Vec::new();
            let mut deletions: Vec<(String, EntityId)> = Vec::new();
            for change in changes {
                match (change.op, change.record) {
                    (ChangeOp::Upsert, Some(record)) => {
                        let zone = record
                            .zone
                            .as_deref()
                            .and_then(ZoneId::parse_key)
                            .unwrap_or_else(|| ZoneId::mirror(user.clone()));
                        saves.push(RemoteRecord::from_record(&record, zone));
                    }
                    (ChangeOp::Upsert, None) => {}
                    (ChangeOp::Delete, _) => deletions.push((change.entity, change.id)),
                }
            }

            if !saves.is_empty() {
                pushed += self.inner.remote.save(scope, saves).await?.len();
            }
            if !deletions.is_empty() {
                for zone in self.inner.remote.all_zones(scope).await? {
                    pushed += self
                        .inner
                        .remote
                        .delete_records(scope, &zone, &deletions)
                        .await?;
                }
            }
            if last_seq > cursor {
                store.set_mirror_cursor(scope, last_seq).await?;
            }
        }

        info!(
            "event=mirror_push module=mirror status=ok pushed={} duration_ms={}",
            pushed,
            started_at.elapsed().as_millis()
        );
        Ok(pushed)
    }

    /// Applies remote zone changes since the last pull to the local store.
    ///
    /// Returns the number of local rows written; `0` while mirroring is
    /// inactive.
    pub async fn pull(&self) -> MirrorResult<usize> {
        if !self.is_enabled() {
            debug!("event=mirror_pull module=mirror status=skipped reason=disabled");
            return Ok(0);
        }
        let _guard = self.inner.sync_lock.lock().await;
        let started_at = Instant::now();
        let store = &self.inner.store;

        let mut applied = 0usize;
        for scope in store.scopes() {
            let zones = self.inner.remote.all_zones(scope).await?;
            // Zones deleted remotely, e.g. by a purge on another device.
            for key in store.zone_token_keys(scope).await? {
                if zones.iter().any(|zone| zone.key() == key) {
                    continue;
                }
                let removed = store.forget_remote_zone(scope, &key).await?;
                info!("event=mirror_zone_gone module=mirror status=ok zone={key} removed={removed}");
                applied += removed;
            }

            for zone in zones {
                let key = zone.key();
                let since = store.zone_token(scope, &key).await?;
                let changes = self
                    .inner
                    .remote
                    .fetch_zone_changes(scope, &zone, since)
                    .await?;
                if Some(changes.token) == since {
                    continue;
                }

                let remote_changes = RemoteChanges {
                    upserts: changes
                        .changed
                        .into_iter()
                        .map(RemoteRecord::into_record)
                        .collect(),
                    deletions: changes.deleted,
                };
                applied += store
                    .apply_remote_changes(scope, Some(key.clone()), remote_changes)
                    .await?;
                store.set_zone_token(scope, &key, changes.token).await?;
            }
        }

        info!(
            "event=mirror_pull module=mirror status=ok applied={} duration_ms={}",
            applied,
            started_at.elapsed().as_millis()
        );
        Ok(applied)
    }

    /// Pushes after every committed context save while mirroring is active.
    ///
    /// The task ends once the store's change feed closes or this mirror
    /// has been dropped.
    pub fn observe(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut feed = self.inner.store.subscribe();

        tokio::spawn(async move {
            loop {
                let should_push = match feed.recv().await {
                    Ok(notification) => matches!(notification.source, ChangeSource::Context(_)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("event=mirror_observe module=mirror status=lagged skipped={skipped}");
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let mirror = SyncMirror { inner };
                if should_push && mirror.is_enabled() {
                    if let Err(err) = mirror.push_pending().await {
                        log_entry(Level::Warn, "SyncMirror::observe", "Push changes", &[&err]);
                    }
                }
            }
            debug!("event=mirror_observe module=mirror status=stopped");
        })
    }

    async fn delete_private_zones(&self) -> MirrorResult<usize> {
        let zones = self.inner.remote.all_zones(StoreScope::Private).await?;
        let mut first_error = None;
        let mut removed = 0usize;
        for zone in zones {
            match self.inner.remote.delete_zone(StoreScope::Private, &zone).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!("event=mirror_zone_delete module=mirror status=error zone={zone} error={err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    /// Marks all local history as exported and forgets zone tokens.
    async fn forget_history(&self) -> MirrorResult<()> {
        let store = &self.inner.store;
        for scope in store.scopes() {
            let cursor = store.mirror_cursor(scope).await?;
            let (_, last_seq) = store.pending_changes(scope, cursor).await?;
            store.set_mirror_cursor(scope, last_seq).await?;
            store.clear_zone_tokens(scope).await?;
        }
        Ok(())
    }

    async fn share_of<E: ManagedEntity>(
        &self,
        context: &Context,
        entity: &E,
    ) -> MirrorResult<(StoreScope, Option<Share>)> {
        let object_id = context.object_id(entity).await.ok_or(MirrorError::NotRegistered)?;
        let scope = self
            .inner
            .store
            .scope_of(object_id.store())
            .ok_or(MirrorError::NotRegistered)?;
        let record = context
            .existing_object(&object_id)
            .await?
            .ok_or_else(|| MirrorError::RecordNotFound(object_id.uri_representation()))?;

        let Some(zone) = record.zone.as_deref().and_then(ZoneId::parse_key) else {
            return Ok((scope, None));
        };
        let share = self.inner.remote.fetch_share(scope, &zone).await?;
        Ok((scope, share))
    }
}

#[cfg(test)]
mod tests {
    use super::{configure, SyncMirror};
    use crate::mirror::{MemoryRemoteDatabase, RemoteDatabase, RemoteQuery, ZoneId};
    use crate::model::entity::ManagedEntity;
    use crate::model::predicate::Predicate;
    use crate::model::schema::{EntityDescription, Schema};
    use crate::store::{LocalStore, StoreDescriptor, StoreLocation, StoreScope};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: Uuid,
        body: String,
    }

    impl ManagedEntity for Note {
        const ENTITY_NAME: &'static str = "Note";

        fn id(&self) -> Uuid {
            self.id
        }
    }

    fn note(body: &str) -> Note {
        Note {
            id: Uuid::new_v4(),
            body: body.to_string(),
        }
    }

    fn open_store() -> LocalStore {
        let private = configure(
            StoreDescriptor::private(StoreLocation::InMemory),
            "iCloud.test",
            true,
        );
        let shared = private.shared_copy(StoreLocation::InMemory);
        let schema = Schema::new("Notes", vec![EntityDescription::new("Note")]).unwrap();
        LocalStore::try_open(vec![private, shared], schema).unwrap()
    }

    #[test]
    fn configure_attaches_or_clears_mirror_options() {
        let enabled = configure(StoreDescriptor::private(StoreLocation::InMemory), "iCloud.test", true);
        let options = enabled.mirror.clone().unwrap();
        assert_eq!(options.container_id, "iCloud.test");
        assert_eq!(options.database_scope, StoreScope::Private);
        assert_eq!(
            enabled.shared_copy(StoreLocation::InMemory).mirror.unwrap().database_scope,
            StoreScope::Shared
        );

        let disabled = configure(enabled, "iCloud.test", false);
        assert!(disabled.mirror.is_none());
    }

    #[tokio::test]
    async fn pushes_are_pulled_into_another_store() {
        let remote = Arc::new(MemoryRemoteDatabase::signed_in("iCloud.test", "alice"));
        let first = open_store();
        let second = open_store();
        let first_mirror = SyncMirror::new(first.clone(), remote.clone(), true);
        let second_mirror = SyncMirror::new(second.clone(), remote.clone(), true);

        let context = first.main_context();
        let draft = note("draft");
        context.insert(&draft).await.unwrap();
        context.save().await.unwrap();

        assert_eq!(first_mirror.push_pending().await.unwrap(), 1);
        assert_eq!(first_mirror.push_pending().await.unwrap(), 0);
        assert_eq!(second_mirror.pull().await.unwrap(), 1);
        assert_eq!(second.count("Note").await.unwrap(), 1);

        // Pulled rows are remote-origin and never echo back.
        assert_eq!(second_mirror.push_pending().await.unwrap(), 0);
        assert_eq!(second_mirror.pull().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zones_purged_elsewhere_are_removed_on_pull() {
        let remote = Arc::new(MemoryRemoteDatabase::signed_in("iCloud.test", "alice"));
        let first = open_store();
        let second = open_store();
        let first_mirror = SyncMirror::new(first.clone(), remote.clone(), true);
        let second_mirror = SyncMirror::new(second.clone(), remote.clone(), true);

        let context = first.main_context();
        context.insert(&note("draft")).await.unwrap();
        context.insert(&note("outline")).await.unwrap();
        context.save().await.unwrap();
        first_mirror.push_pending().await.unwrap();
        assert_eq!(second_mirror.pull().await.unwrap(), 2);

        let local_only = note("unsynced");
        let second_context = second.main_context();
        second_context.insert(&local_only).await.unwrap();
        second_context.save().await.unwrap();

        first_mirror.purge_remote().await.unwrap();
        assert_eq!(second_mirror.pull().await.unwrap(), 2);
        assert_eq!(second.count("Note").await.unwrap(), 1);
        assert_eq!(second_mirror.pull().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_mirror_is_inert() {
        let remote = Arc::new(MemoryRemoteDatabase::signed_in("iCloud.test", "alice"));
        let store = open_store();
        let mirror = SyncMirror::new(store.clone(), remote.clone(), false);

        let context = store.main_context();
        context.insert(&note("offline")).await.unwrap();
        context.save().await.unwrap();

        assert_eq!(mirror.push_pending().await.unwrap(), 0);
        assert_eq!(mirror.pull().await.unwrap(), 0);
        assert_eq!(remote.record_count(StoreScope::Private).await, 0);
    }

    #[tokio::test]
    async fn ownership_follows_the_zone_share() {
        let remote = Arc::new(MemoryRemoteDatabase::signed_in("iCloud.test", "bob"));
        let store = open_store();
        let mirror = SyncMirror::new(store.clone(), remote.clone(), true);

        // Alice's zone is shared with bob.
        let zone = ZoneId::new("trip", "alice");
        let shared_note = note("packing list");
        remote
            .share_zone(
                StoreScope::Shared,
                crate::mirror::Share::new(zone.clone())
                    .with_participant("bob", crate::mirror::ParticipantRole::PrivateUser),
            )
            .await;
        let record = crate::model::entity::Record::from_entity(&shared_note).unwrap();
        remote
            .save(
                StoreScope::Shared,
                vec![crate::mirror::RemoteRecord::from_record(&record, zone)],
            )
            .await
            .unwrap();
        mirror.pull().await.unwrap();

        let own_note = note("groceries");
        let context = store.main_context();
        context.insert(&own_note).await.unwrap();
        context.save().await.unwrap();
        let fetched = context
            .fetch(&crate::store::FetchRequest::new("Note").with_predicate(Some(Predicate::id(shared_note.id))))
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);

        assert!(mirror.is_shared(&context, &shared_note).await);
        assert!(!mirror.is_owner(&context, &shared_note).await);
        assert!(!mirror.is_shared(&context, &own_note).await);
        assert!(mirror.is_owner(&context, &own_note).await);

        // Unregistered objects fail closed.
        let stranger = note("stranger");
        assert!(!mirror.is_shared(&context, &stranger).await);
        assert!(!mirror.is_owner(&context, &stranger).await);
    }

    #[tokio::test]
    async fn has_remote_records_is_three_state() {
        let remote = Arc::new(MemoryRemoteDatabase::signed_in("iCloud.test", "alice"));
        let store = open_store();
        let mirror = SyncMirror::new(store.clone(), remote.clone(), true);
        let query = RemoteQuery::new("Note", Predicate::All);

        assert_eq!(mirror.has_remote_records(&query).await, None);

        let context = store.main_context();
        context.insert(&note("hello")).await.unwrap();
        context.save().await.unwrap();
        mirror.push_pending().await.unwrap();
        assert_eq!(mirror.has_remote_records(&query).await, Some(true));

        remote.set_reachable(false).await;
        assert_eq!(mirror.has_remote_records(&query).await, Some(false));
    }
}
