//! Unit-of-work contexts over the local store.
//!
//! # Responsibility
//! - Track objects registered through fetches and inserts.
//! - Collect pending inserts, updates and deletes until a save.
//! - Merge changes committed by sibling contexts before every operation.
//!
//! # Invariants
//! - Operations on one context are serialized by its state lock.
//! - `save_if_needed` never touches the store without pending changes.
//! - An object can only be updated or deleted by the context that
//!   registered it.
//! - On save, a property changed in the store since this context read it
//!   keeps the store value.

use super::fetch::FetchRequest;
use super::local_store::{
    delete_row, insert_row, log_change, overwrite_row, read_record, select_records, ChangeNotification,
    ChangeOp, ChangeOrigin, ChangeSource, StoreInner,
};
use super::merge::merge_store_trump;
use super::{StoreError, StoreResult, StoreScope};
use crate::model::entity::{EntityId, ManagedEntity, Record};
use crate::model::object_id::ObjectId;
use log::{debug, info};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};

/// Last known store snapshot of a registered object.
#[derive(Debug, Clone)]
struct Registered {
    scope: StoreScope,
    base: Record,
}

struct ContextState {
    registered: HashMap<ObjectId, Registered>,
    inserted: BTreeMap<ObjectId, Record>,
    updated: BTreeMap<ObjectId, Record>,
    deleted: BTreeMap<ObjectId, Record>,
    feed: broadcast::Receiver<ChangeNotification>,
}

impl ContextState {
    fn has_changes(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }

    fn has_changes_for(&self, entity: &str) -> bool {
        [&self.inserted, &self.updated, &self.deleted]
            .iter()
            .any(|pending| pending.keys().any(|object_id| object_id.entity() == entity))
    }

    fn forget(&mut self, object_id: &ObjectId) {
        self.registered.remove(object_id);
        self.inserted.remove(object_id);
        self.updated.remove(object_id);
        self.deleted.remove(object_id);
    }
}

struct ContextInner {
    id: u64,
    name: &'static str,
    is_main: bool,
    store: Arc<StoreInner>,
    state: Mutex<ContextState>,
}

/// Handle to one unit of work. Clones share the same state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct InsertEntry {
    object_id: ObjectId,
    scope: StoreScope,
    record: Record,
}

struct UpdateEntry {
    object_id: ObjectId,
    scope: StoreScope,
    base: Record,
    local: Record,
}

struct DeleteEntry {
    object_id: ObjectId,
    scope: StoreScope,
    entity: String,
    id: EntityId,
}

struct SaveBatch {
    inserts: Vec<InsertEntry>,
    updates: Vec<UpdateEntry>,
    deletes: Vec<DeleteEntry>,
}

struct SavedObject {
    object_id: ObjectId,
    scope: StoreScope,
    record: Record,
    inserted: bool,
}

impl Context {
    pub(super) fn new(store: Arc<StoreInner>, name: &'static str, is_main: bool) -> Self {
        let state = ContextState {
            registered: HashMap::new(),
            inserted: BTreeMap::new(),
            updated: BTreeMap::new(),
            deleted: BTreeMap::new(),
            feed: store.subscribe(),
        };
        Self {
            inner: Arc::new(ContextInner {
                id: store.next_context_id(),
                name,
                is_main,
                store,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        self.inner.name
    }

    pub fn is_main(&self) -> bool {
        self.inner.is_main
    }

    /// Whether inserts, updates or deletes are waiting for a save.
    pub async fn has_changes(&self) -> bool {
        self.inner.state.lock().await.has_changes()
    }

    /// Fetches records, registering each result in this context.
    ///
    /// Results reflect this context's unsaved work: pending deletes are
    /// hidden, pending updates are matched and sorted by their new value,
    /// and matching pending inserts are included before limit and offset
    /// apply.
    pub async fn fetch(&self, request: &FetchRequest) -> StoreResult<Vec<Record>> {
        let store = &self.inner.store;
        store.ensure_entity(&request.entity)?;

        let mut state = self.inner.state.lock().await;
        self.merge_changes(&mut state).await?;

        let scopes = store.scopes();
        if !state.has_changes_for(&request.entity) {
            let owned_request = request.clone();
            let rows = store
                .run(move |conn| select_records(conn, &scopes, &owned_request))
                .await?;
            let mut results = Vec::with_capacity(rows.len());
            for (scope, record) in rows {
                let Some(object_id) = store.object_id(scope, &record.entity, record.id) else {
                    continue;
                };
                results.push(record.clone());
                state.registered.insert(object_id, Registered { scope, base: record });
            }
            self.log_fetch(request, results.len());
            return Ok(results);
        }

        // Stored rows are matched in memory so pending values see the same
        // predicate; the store order is kept for ties.
        let mut unfiltered = request.clone();
        unfiltered.predicate = None;
        unfiltered.fetch_limit = 0;
        unfiltered.fetch_offset = 0;
        let rows = store
            .run(move |conn| select_records(conn, &scopes, &unfiltered))
            .await?;

        let predicate = request.predicate.clone().unwrap_or_default();
        let mut candidates: Vec<(Record, Option<(ObjectId, StoreScope)>)> = Vec::new();
        for (scope, record) in rows {
            let Some(object_id) = store.object_id(scope, &record.entity, record.id) else {
                continue;
            };
            if state.deleted.contains_key(&object_id) {
                continue;
            }
            match state.updated.get(&object_id) {
                Some(pending) => candidates.push((pending.clone(), None)),
                None => candidates.push((record, Some((object_id, scope)))),
            }
        }
        for record in state.inserted.values() {
            if record.entity == request.entity {
                candidates.push((record.clone(), None));
            }
        }
        candidates.retain(|(record, _)| predicate.matches(record.id, &record.attributes));
        candidates.sort_by(|(left, _), (right, _)| request.compare(&left.attributes, &right.attributes));

        let page = candidates.into_iter().skip(request.fetch_offset);
        let page: Vec<_> = if request.fetch_limit > 0 {
            page.take(request.fetch_limit).collect()
        } else {
            page.collect()
        };

        let mut results = Vec::with_capacity(page.len());
        for (record, stored) in page {
            if let Some((object_id, scope)) = stored {
                state.registered.insert(
                    object_id,
                    Registered {
                        scope,
                        base: record.clone(),
                    },
                );
            }
            results.push(record);
        }
        self.log_fetch(request, results.len());
        Ok(results)
    }

    fn log_fetch(&self, request: &FetchRequest, count: usize) {
        debug!(
            "event=context_fetch module=store status=ok context={} entity={} count={}",
            self.inner.name, request.entity, count
        );
    }

    /// Registers a new object for insertion into the private store.
    pub async fn insert<E: ManagedEntity>(&self, entity: &E) -> StoreResult<ObjectId> {
        let store = &self.inner.store;
        store.ensure_entity(E::ENTITY_NAME)?;
        let record = Record::from_entity(entity)?;
        let object_id = store
            .object_id(StoreScope::Private, &record.entity, record.id)
            .ok_or_else(|| StoreError::InvalidDescriptor("no private store is attached".to_string()))?;

        let mut state = self.inner.state.lock().await;
        self.merge_changes(&mut state).await?;

        if state.deleted.remove(&object_id).is_some() {
            state.updated.insert(object_id.clone(), record);
        } else if let Some(pending) = state.inserted.get_mut(&object_id) {
            *pending = record;
        } else if state.registered.contains_key(&object_id) {
            state.updated.insert(object_id.clone(), record);
        } else {
            state.registered.insert(
                object_id.clone(),
                Registered {
                    scope: StoreScope::Private,
                    base: record.clone(),
                },
            );
            state.inserted.insert(object_id.clone(), record);
        }
        Ok(object_id)
    }

    /// Records the current value of an object registered in this context.
    pub async fn update<E: ManagedEntity>(&self, entity: &E) -> StoreResult<ObjectId> {
        let record = Record::from_entity(entity)?;
        let mut state = self.inner.state.lock().await;
        self.merge_changes(&mut state).await?;

        let object_id = self.registered_id(&state, &record.entity, record.id)?;
        if state.deleted.contains_key(&object_id) {
            return Err(StoreError::NotRegistered(object_id.uri_representation()));
        }

        if let Some(pending) = state.inserted.get_mut(&object_id) {
            *pending = record;
            return Ok(object_id);
        }

        let unchanged = state
            .registered
            .get(&object_id)
            .is_some_and(|registered| registered.base.attributes == record.attributes);
        if unchanged {
            state.updated.remove(&object_id);
        } else {
            state.updated.insert(object_id.clone(), record);
        }
        Ok(object_id)
    }

    /// Marks an object registered in this context for deletion.
    pub async fn delete<E: ManagedEntity>(&self, entity: &E) -> StoreResult<ObjectId> {
        let mut state = self.inner.state.lock().await;
        self.merge_changes(&mut state).await?;

        let object_id = self.registered_id(&state, E::ENTITY_NAME, entity.id())?;
        if state.inserted.remove(&object_id).is_some() {
            // Never saved: forgetting it is the whole delete.
            state.registered.remove(&object_id);
            return Ok(object_id);
        }

        state.updated.remove(&object_id);
        if let Some(registered) = state.registered.get(&object_id) {
            let base = registered.base.clone();
            state.deleted.insert(object_id.clone(), base);
        }
        Ok(object_id)
    }

    /// Returns the identifier of a registered object.
    pub async fn object_id<E: ManagedEntity>(&self, entity: &E) -> Option<ObjectId> {
        let state = self.inner.state.lock().await;
        self.registered_id(&state, E::ENTITY_NAME, entity.id()).ok()
    }

    /// Looks up the live record named by `object_id`, registering it.
    ///
    /// Returns `None` when the id names an unknown store or entity kind,
    /// or no record exists.
    pub async fn existing_object(&self, object_id: &ObjectId) -> StoreResult<Option<Record>> {
        let store = &self.inner.store;
        let Some(scope) = store.scope_of(object_id.store()) else {
            return Ok(None);
        };
        if store.ensure_entity(object_id.entity()).is_err() {
            return Ok(None);
        }

        let mut state = self.inner.state.lock().await;
        self.merge_changes(&mut state).await?;

        if state.deleted.contains_key(object_id) {
            return Ok(None);
        }
        if let Some(pending) = state
            .inserted
            .get(object_id)
            .or_else(|| state.updated.get(object_id))
        {
            return Ok(Some(pending.clone()));
        }

        let entity = object_id.entity().to_string();
        let id = object_id.id();
        let row = store
            .run(move |conn| read_record(conn, scope, &entity, id))
            .await?;
        if let Some(record) = &row {
            state.registered.insert(
                object_id.clone(),
                Registered {
                    scope,
                    base: record.clone(),
                },
            );
        }
        Ok(row)
    }

    /// Saves only when there are pending changes.
    ///
    /// Returns `true` when a save was performed.
    pub async fn save_if_needed(&self) -> StoreResult<bool> {
        let mut state = self.inner.state.lock().await;
        if !state.has_changes() {
            return Ok(false);
        }
        self.save_locked(&mut state).await?;
        Ok(true)
    }

    /// Commits all pending changes in one transaction.
    pub async fn save(&self) -> StoreResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.has_changes() {
            self.save_locked(&mut state).await?;
        }
        Ok(())
    }

    /// Discards pending changes; pending inserts are forgotten.
    pub async fn rollback(&self) {
        let mut state = self.inner.state.lock().await;
        let inserted: Vec<ObjectId> = state.inserted.keys().cloned().collect();
        for object_id in inserted {
            state.forget(&object_id);
        }
        state.updated.clear();
        state.deleted.clear();
    }

    /// Forgets every registered object and pending change.
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        state.registered.clear();
        state.inserted.clear();
        state.updated.clear();
        state.deleted.clear();
    }

    fn registered_id(&self, state: &ContextState, entity: &str, id: EntityId) -> StoreResult<ObjectId> {
        StoreScope::ALL
            .iter()
            .filter_map(|scope| self.inner.store.object_id(*scope, entity, id))
            .find(|object_id| state.registered.contains_key(object_id))
            .ok_or_else(|| StoreError::NotRegistered(format!("{entity}/{id}")))
    }

    async fn save_locked(&self, state: &mut ContextState) -> StoreResult<()> {
        let started_at = Instant::now();
        let scope_of = |state: &ContextState, object_id: &ObjectId| {
            state
                .registered
                .get(object_id)
                .map_or(StoreScope::Private, |registered| registered.scope)
        };

        let batch = SaveBatch {
            inserts: state
                .inserted
                .iter()
                .map(|(object_id, record)| InsertEntry {
                    object_id: object_id.clone(),
                    scope: scope_of(state, object_id),
                    record: record.clone(),
                })
                .collect(),
            updates: state
                .updated
                .iter()
                .filter_map(|(object_id, local)| {
                    let registered = state.registered.get(object_id)?;
                    Some(UpdateEntry {
                        object_id: object_id.clone(),
                        scope: registered.scope,
                        base: registered.base.clone(),
                        local: local.clone(),
                    })
                })
                .collect(),
            deletes: state
                .deleted
                .iter()
                .map(|(object_id, record)| DeleteEntry {
                    object_id: object_id.clone(),
                    scope: scope_of(state, object_id),
                    entity: record.entity.clone(),
                    id: record.id,
                })
                .collect(),
        };
        let deleted: Vec<ObjectId> = batch
            .deletes
            .iter()
            .map(|entry| entry.object_id.clone())
            .collect();

        let saved = self
            .inner
            .store
            .run(move |conn| commit_batch(conn, batch))
            .await?;

        let mut notification = ChangeNotification {
            source: ChangeSource::Context(self.inner.id),
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: deleted.clone(),
            cleared_entities: Vec::new(),
        };

        state.inserted.clear();
        state.updated.clear();
        state.deleted.clear();
        for object_id in &deleted {
            state.registered.remove(object_id);
        }
        for saved_object in saved {
            if saved_object.inserted {
                notification.inserted.push(saved_object.object_id.clone());
            } else {
                notification.updated.push(saved_object.object_id.clone());
            }
            state.registered.insert(
                saved_object.object_id,
                Registered {
                    scope: saved_object.scope,
                    base: saved_object.record,
                },
            );
        }

        info!(
            "event=context_save module=store status=ok context={} inserted={} updated={} deleted={} duration_ms={}",
            self.inner.name,
            notification.inserted.len(),
            notification.updated.len(),
            notification.deleted.len(),
            started_at.elapsed().as_millis()
        );
        self.inner.store.publish(notification);
        Ok(())
    }

    /// Applies notifications from other writers to registered snapshots.
    async fn merge_changes(&self, state: &mut ContextState) -> StoreResult<()> {
        let mut refresh: Vec<ObjectId> = Vec::new();
        let mut refresh_all = false;

        loop {
            match state.feed.try_recv() {
                Ok(notification) => {
                    if notification.source == ChangeSource::Context(self.inner.id) {
                        continue;
                    }
                    for object_id in &notification.deleted {
                        state.forget(object_id);
                    }
                    for entity in &notification.cleared_entities {
                        state.registered.retain(|object_id, _| object_id.entity() != entity);
                        state.updated.retain(|object_id, _| object_id.entity() != entity);
                        state.deleted.retain(|object_id, _| object_id.entity() != entity);
                    }
                    refresh.extend(notification.updated);
                }
                Err(TryRecvError::Lagged(_)) => refresh_all = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        if refresh_all {
            refresh = state.registered.keys().cloned().collect();
        }
        let targets: Vec<(ObjectId, StoreScope)> = refresh
            .into_iter()
            .filter(|object_id| {
                !state.updated.contains_key(object_id) && !state.inserted.contains_key(object_id)
            })
            .filter_map(|object_id| {
                let scope = state.registered.get(&object_id)?.scope;
                Some((object_id, scope))
            })
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let refreshed = self
            .inner
            .store
            .run(move |conn| {
                let mut rows = Vec::with_capacity(targets.len());
                for (object_id, scope) in targets {
                    let record = read_record(conn, scope, object_id.entity(), object_id.id())?;
                    rows.push((object_id, record));
                }
                Ok(rows)
            })
            .await?;

        for (object_id, record) in refreshed {
            match record {
                Some(record) => {
                    if let Some(registered) = state.registered.get_mut(&object_id) {
                        registered.base = record;
                    }
                }
                None => state.forget(&object_id),
            }
        }
        Ok(())
    }
}

fn commit_batch(conn: &mut Connection, batch: SaveBatch) -> StoreResult<Vec<SavedObject>> {
    let tx = conn.transaction()?;
    let mut saved = Vec::with_capacity(batch.inserts.len() + batch.updates.len());

    for entry in batch.inserts {
        insert_row(&tx, entry.scope, &entry.record)?;
        log_change(
            &tx,
            entry.scope,
            &entry.record.entity,
            entry.record.id,
            ChangeOp::Upsert,
            ChangeOrigin::Local,
        )?;
        let mut record = entry.record;
        record.version = 1;
        saved.push(SavedObject {
            object_id: entry.object_id,
            scope: entry.scope,
            record,
            inserted: true,
        });
    }

    for entry in batch.updates {
        let stored = read_record(&tx, entry.scope, &entry.local.entity, entry.local.id)?
            .ok_or_else(|| StoreError::ObjectDeleted(entry.object_id.clone()))?;

        let mut record = entry.local;
        if stored.version != entry.base.version {
            record.attributes =
                merge_store_trump(&entry.base.attributes, &record.attributes, &stored.attributes);
        }
        record.zone = stored.zone.clone();
        overwrite_row(&tx, entry.scope, &record)?;
        log_change(
            &tx,
            entry.scope,
            &record.entity,
            record.id,
            ChangeOp::Upsert,
            ChangeOrigin::Local,
        )?;
        record.version = stored.version + 1;
        saved.push(SavedObject {
            object_id: entry.object_id,
            scope: entry.scope,
            record,
            inserted: false,
        });
    }

    for entry in batch.deletes {
        if delete_row(&tx, entry.scope, &entry.entity, entry.id)? {
            log_change(
                &tx,
                entry.scope,
                &entry.entity,
                entry.id,
                ChangeOp::Delete,
                ChangeOrigin::Local,
            )?;
        }
    }

    tx.commit()?;
    Ok(saved)
}
