//! Local store bootstrap, bulk reset and change history.
//!
//! # Responsibility
//! - Open the private store and attach the shared store on one connection.
//! - Run SQL on tokio's blocking pool so async callers are never stalled.
//! - Broadcast committed changes to contexts and the remote mirror.
//!
//! # Invariants
//! - Exactly one private store is attached under `main`; at most one
//!   shared store is attached under `shared`.
//! - Every write appends one `change_log` row per touched record.
//! - Rows written from remote changes carry origin `remote` and are never
//!   exported back to the mirror.

use super::context::Context;
use super::descriptor::{StoreDescriptor, StoreScope};
use super::fetch::FetchRequest;
use super::{StoreError, StoreResult};
use crate::db::{attach_db, open_db, open_db_in_memory};
use crate::logging::log_entry;
use crate::model::entity::{EntityId, Record};
use crate::model::object_id::ObjectId;
use crate::model::predicate::Predicate;
use crate::model::schema::Schema;
use log::{error, info, warn, Level};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANGE_FEED_CAPACITY: usize = 256;
const STORE_UUID_KEY: &str = "store_uuid";
const MIRROR_CURSOR_KEY: &str = "mirror_cursor";
const ZONE_TOKEN_PREFIX: &str = "zone_token:";

/// Who produced a committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// A context save; carries the saving context id.
    Context(u64),
    /// Records pulled from the remote mirror.
    Remote,
    /// `LocalStore::reset_all`.
    Reset,
}

/// Broadcast after every committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub source: ChangeSource,
    pub inserted: Vec<ObjectId>,
    pub updated: Vec<ObjectId>,
    pub deleted: Vec<ObjectId>,
    /// Entity kinds whose rows were all removed.
    pub cleared_entities: Vec<String>,
}

impl ChangeNotification {
    fn new(source: ChangeSource) -> Self {
        Self {
            source,
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            cleared_entities: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.cleared_entities.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeOp {
    Upsert,
    Delete,
}

impl ChangeOp {
    fn as_db(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "upsert" => Some(Self::Upsert),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ChangeOrigin {
    Local,
    Remote,
}

impl ChangeOrigin {
    fn as_db(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// One locally originated change awaiting export, collapsed per record.
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
    pub seq: i64,
    pub entity: String,
    pub id: EntityId,
    pub op: ChangeOp,
    /// Current snapshot for upserts.
    pub record: Option<Record>,
}

/// Records pulled from one remote zone.
#[derive(Debug, Clone, Default)]
pub(crate) struct RemoteChanges {
    pub upserts: Vec<Record>,
    pub deletions: Vec<(String, EntityId)>,
}

struct AttachedStore {
    scope: StoreScope,
    store_id: Uuid,
    descriptor: StoreDescriptor,
}

pub(super) struct StoreInner {
    conn: Arc<Mutex<Connection>>,
    schema: Schema,
    stores: Vec<AttachedStore>,
    changes: broadcast::Sender<ChangeNotification>,
    next_context_id: AtomicU64,
}

impl StoreInner {
    /// Runs `op` against the connection on the blocking pool.
    pub(super) async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            op(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }

    pub(super) fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(super) fn scopes(&self) -> Vec<StoreScope> {
        self.stores.iter().map(|store| store.scope).collect()
    }

    pub(super) fn store_id(&self, scope: StoreScope) -> Option<Uuid> {
        self.stores
            .iter()
            .find(|store| store.scope == scope)
            .map(|store| store.store_id)
    }

    pub(super) fn scope_of(&self, store_id: Uuid) -> Option<StoreScope> {
        self.stores
            .iter()
            .find(|store| store.store_id == store_id)
            .map(|store| store.scope)
    }

    pub(super) fn object_id(&self, scope: StoreScope, entity: &str, id: EntityId) -> Option<ObjectId> {
        self.store_id(scope)
            .map(|store_id| ObjectId::new(store_id, entity, id))
    }

    pub(super) fn ensure_entity(&self, entity: &str) -> StoreResult<()> {
        if self.schema.contains(entity) {
            Ok(())
        } else {
            Err(StoreError::UnknownEntity(entity.to_string()))
        }
    }

    pub(super) fn next_context_id(&self) -> u64 {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    pub(super) fn publish(&self, notification: ChangeNotification) {
        if notification.is_empty() {
            return;
        }
        // No receivers is not an error: nobody is observing yet.
        let _ = self.changes.send(notification);
    }
}

/// Owner of the schema and store files; produces contexts.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
    main: Context,
}

impl LocalStore {
    /// Opens the stores described by `descriptors`.
    ///
    /// # Panics
    /// A store that cannot be loaded is a packaging defect, not a runtime
    /// condition: failures are logged and abort startup. Use
    /// [`LocalStore::try_open`] to handle them instead.
    pub fn open(descriptors: Vec<StoreDescriptor>, schema: Schema) -> Self {
        match Self::try_open(descriptors, schema) {
            Ok(store) => store,
            Err(err) => {
                error!("event=store_open module=store status=fatal error={err}");
                panic!("unresolved error opening local store: {err}");
            }
        }
    }

    /// Fallible form of [`LocalStore::open`].
    pub fn try_open(descriptors: Vec<StoreDescriptor>, schema: Schema) -> StoreResult<Self> {
        let started_at = Instant::now();
        let (private, shared) = split_descriptors(descriptors)?;

        let mut conn = match private.location.path() {
            Some(path) => open_db(path)?,
            None => open_db_in_memory()?,
        };
        if let Some(shared) = &shared {
            attach_db(
                &mut conn,
                shared.location.path(),
                StoreScope::Shared.schema(),
            )?;
        }

        let mut stores = Vec::new();
        for descriptor in std::iter::once(private).chain(shared) {
            let store_id = ensure_store_uuid(&conn, descriptor.scope)?;
            stores.push(AttachedStore {
                scope: descriptor.scope,
                store_id,
                descriptor,
            });
        }

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let inner = Arc::new(StoreInner {
            conn: Arc::new(Mutex::new(conn)),
            schema,
            stores,
            changes,
            next_context_id: AtomicU64::new(1),
        });
        let main = Context::new(Arc::clone(&inner), "main", true);

        info!(
            "event=store_open module=store status=ok model={} stores={} entities={} duration_ms={}",
            inner.schema.name,
            inner.stores.len(),
            inner.schema.entities.len(),
            started_at.elapsed().as_millis()
        );
        Ok(Self { inner, main })
    }

    /// Shared read/write context; auto-merges changes from every other context.
    pub fn main_context(&self) -> Context {
        self.main.clone()
    }

    /// Fresh isolated unit of work; auto-merges changes saved elsewhere.
    pub fn background_context(&self) -> Context {
        Context::new(Arc::clone(&self.inner), "background", false)
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn descriptor(&self, scope: StoreScope) -> Option<&StoreDescriptor> {
        self.inner
            .stores
            .iter()
            .find(|store| store.scope == scope)
            .map(|store| &store.descriptor)
    }

    pub fn store_id(&self, scope: StoreScope) -> Option<Uuid> {
        self.inner.store_id(scope)
    }

    /// Scope of the attached store with this uuid.
    pub fn scope_of(&self, store_id: Uuid) -> Option<StoreScope> {
        self.inner.scope_of(store_id)
    }

    /// Attached store scopes, private first.
    pub fn scopes(&self) -> Vec<StoreScope> {
        self.inner.scopes()
    }

    /// Subscribes to committed-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.subscribe()
    }

    /// Counts stored records of one entity kind across all stores.
    pub async fn count(&self, entity: &str) -> StoreResult<usize> {
        self.inner.ensure_entity(entity)?;
        let scopes = self.inner.scopes();
        let entity = entity.to_string();
        self.inner
            .run(move |conn| {
                let mut total = 0usize;
                for scope in scopes {
                    let count: i64 = conn.query_row(
                        &format!(
                            "SELECT COUNT(*) FROM {}.records WHERE entity = ?1;",
                            scope.schema()
                        ),
                        [entity.as_str()],
                        |row| row.get(0),
                    )?;
                    total += usize::try_from(count).unwrap_or(0);
                }
                Ok(total)
            })
            .await
    }

    /// Deletes every record of every schema entity kind.
    ///
    /// Each kind is cleared in its own transaction. A kind that fails is
    /// logged and skipped; the remaining kinds are still cleared.
    pub async fn reset_all(&self) -> StoreResult<()> {
        let started_at = Instant::now();
        let entities: Vec<String> = self.inner.schema.entity_names().map(str::to_string).collect();
        let scopes = self.inner.scopes();

        let (cleared, failed) = self
            .inner
            .run(move |conn| {
                let mut cleared = Vec::new();
                let mut failed = 0usize;
                for entity in entities {
                    match delete_entity_rows(conn, &scopes, &entity) {
                        Ok(removed) => {
                            info!(
                                "event=store_reset module=store status=ok entity={} removed={}",
                                entity, removed
                            );
                            cleared.push(entity);
                        }
                        Err(err) => {
                            failed += 1;
                            log_entry(
                                Level::Error,
                                "LocalStore::reset_all",
                                "Remove records",
                                &[&format!("entity={entity}"), &err],
                            );
                        }
                    }
                }
                Ok((cleared, failed))
            })
            .await?;

        let mut notification = ChangeNotification::new(ChangeSource::Reset);
        notification.cleared_entities = cleared;
        self.inner.publish(notification);

        if failed > 0 {
            warn!(
                "event=store_reset module=store status=partial failed_kinds={} duration_ms={}",
                failed,
                started_at.elapsed().as_millis()
            );
        } else {
            info!(
                "event=store_reset module=store status=ok duration_ms={}",
                started_at.elapsed().as_millis()
            );
        }
        Ok(())
    }

    /// Local changes after `after_seq`, collapsed to the latest per record,
    /// plus the highest sequence number seen (of any origin).
    pub(crate) async fn pending_changes(
        &self,
        scope: StoreScope,
        after_seq: i64,
    ) -> StoreResult<(Vec<PendingChange>, i64)> {
        self.require_scope(scope)?;
        self.inner
            .run(move |conn| read_pending_changes(conn, scope, after_seq))
            .await
    }

    pub(crate) async fn mirror_cursor(&self, scope: StoreScope) -> StoreResult<i64> {
        self.require_scope(scope)?;
        let value = self
            .inner
            .run(move |conn| read_metadata(conn, scope, MIRROR_CURSOR_KEY))
            .await?;
        Ok(value.and_then(|text| text.parse().ok()).unwrap_or(0))
    }

    pub(crate) async fn set_mirror_cursor(&self, scope: StoreScope, seq: i64) -> StoreResult<()> {
        self.require_scope(scope)?;
        self.inner
            .run(move |conn| write_metadata(conn, scope, MIRROR_CURSOR_KEY, &seq.to_string()))
            .await
    }

    pub(crate) async fn zone_token(&self, scope: StoreScope, zone: &str) -> StoreResult<Option<u64>> {
        self.require_scope(scope)?;
        let key = format!("{ZONE_TOKEN_PREFIX}{zone}");
        let value = self
            .inner
            .run(move |conn| read_metadata(conn, scope, &key))
            .await?;
        Ok(value.and_then(|text| text.parse().ok()))
    }

    pub(crate) async fn set_zone_token(&self, scope: StoreScope, zone: &str, token: u64) -> StoreResult<()> {
        self.require_scope(scope)?;
        let key = format!("{ZONE_TOKEN_PREFIX}{zone}");
        self.inner
            .run(move |conn| write_metadata(conn, scope, &key, &token.to_string()))
            .await
    }

    /// Forgets every remote zone change token of `scope`.
    pub(crate) async fn clear_zone_tokens(&self, scope: StoreScope) -> StoreResult<usize> {
        self.require_scope(scope)?;
        let pattern = format!("{ZONE_TOKEN_PREFIX}%");
        self.inner
            .run(move |conn| {
                let removed = conn.execute(
                    &format!(
                        "DELETE FROM {}.store_metadata WHERE key LIKE ?1;",
                        scope.schema()
                    ),
                    [pattern],
                )?;
                Ok(removed)
            })
            .await
    }

    /// Keys of the remote zones this store holds a change token for.
    pub(crate) async fn zone_token_keys(&self, scope: StoreScope) -> StoreResult<Vec<String>> {
        self.require_scope(scope)?;
        let pattern = format!("{ZONE_TOKEN_PREFIX}%");
        self.inner
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT key FROM {}.store_metadata WHERE key LIKE ?1 ORDER BY key;",
                    scope.schema()
                ))?;
                let keys = stmt
                    .query_map([pattern], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(keys
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(ZONE_TOKEN_PREFIX).map(str::to_string))
                    .collect())
            })
            .await
    }

    /// Deletes every row pulled from a zone that no longer exists remotely
    /// and forgets its change token.
    ///
    /// Returns the number of rows removed.
    pub(crate) async fn forget_remote_zone(&self, scope: StoreScope, zone: &str) -> StoreResult<usize> {
        self.require_scope(scope)?;
        let zone_key = zone.to_string();
        let rows = self
            .inner
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT entity, id FROM {}.records WHERE zone = ?1;",
                    scope.schema()
                ))?;
                let rows = stmt
                    .query_map([zone_key], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut deletions = Vec::with_capacity(rows.len());
        for (entity, id) in rows {
            deletions.push((entity, parse_uuid(&id)?));
        }
        let removed = self
            .apply_remote_changes(
                scope,
                None,
                RemoteChanges {
                    upserts: Vec::new(),
                    deletions,
                },
            )
            .await?;

        let key = format!("{ZONE_TOKEN_PREFIX}{zone}");
        self.inner
            .run(move |conn| {
                conn.execute(
                    &format!("DELETE FROM {}.store_metadata WHERE key = ?1;", scope.schema()),
                    [key],
                )?;
                Ok(())
            })
            .await?;
        Ok(removed)
    }

    /// Applies pulled remote changes; the remote value replaces local state.
    ///
    /// Returns the number of rows written.
    pub(crate) async fn apply_remote_changes(
        &self,
        scope: StoreScope,
        zone: Option<String>,
        changes: RemoteChanges,
    ) -> StoreResult<usize> {
        self.require_scope(scope)?;
        let inner = Arc::clone(&self.inner);
        let known: Vec<String> = self.inner.schema.entity_names().map(str::to_string).collect();

        let (written, touched) = self
            .inner
            .run(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0usize;
                let mut touched = Vec::new();

                for mut record in changes.upserts {
                    if !known.contains(&record.entity) {
                        warn!(
                            "event=mirror_apply module=store status=skipped reason=unknown_entity entity={}",
                            record.entity
                        );
                        continue;
                    }
                    record.zone = zone.clone();
                    let existed = read_record(&tx, scope, &record.entity, record.id)?.is_some();
                    if existed {
                        overwrite_row(&tx, scope, &record)?;
                    } else {
                        insert_row(&tx, scope, &record)?;
                    }
                    log_change(&tx, scope, &record.entity, record.id, ChangeOp::Upsert, ChangeOrigin::Remote)?;
                    touched.push((record.entity, record.id, existed, false));
                    written += 1;
                }

                for (entity, id) in changes.deletions {
                    if delete_row(&tx, scope, &entity, id)? {
                        log_change(&tx, scope, &entity, id, ChangeOp::Delete, ChangeOrigin::Remote)?;
                        touched.push((entity, id, true, true));
                        written += 1;
                    }
                }

                tx.commit()?;
                Ok((written, touched))
            })
            .await?;

        let mut notification = ChangeNotification::new(ChangeSource::Remote);
        for (entity, id, existed, deleted) in touched {
            let Some(object_id) = inner.object_id(scope, &entity, id) else {
                continue;
            };
            match (existed, deleted) {
                (_, true) => notification.deleted.push(object_id),
                (true, false) => notification.updated.push(object_id),
                (false, false) => notification.inserted.push(object_id),
            }
        }
        self.inner.publish(notification);
        Ok(written)
    }

    fn require_scope(&self, scope: StoreScope) -> StoreResult<()> {
        if self.inner.store_id(scope).is_some() {
            Ok(())
        } else {
            Err(StoreError::InvalidDescriptor(format!(
                "no {} store is attached",
                scope.as_str()
            )))
        }
    }
}

fn split_descriptors(
    descriptors: Vec<StoreDescriptor>,
) -> StoreResult<(StoreDescriptor, Option<StoreDescriptor>)> {
    let mut private = None;
    let mut shared = None;
    for descriptor in descriptors {
        let slot = match descriptor.scope {
            StoreScope::Private => &mut private,
            StoreScope::Shared => &mut shared,
        };
        if slot.is_some() {
            return Err(StoreError::InvalidDescriptor(format!(
                "more than one {} store",
                descriptor.scope.as_str()
            )));
        }
        *slot = Some(descriptor);
    }

    let private = private.ok_or_else(|| {
        StoreError::InvalidDescriptor("a private store descriptor is required".to_string())
    })?;
    if let (Some(a), Some(b)) = (private.location.path(), shared.as_ref().and_then(|s| s.location.path())) {
        if a == b {
            return Err(StoreError::InvalidDescriptor(
                "private and shared stores must use different files".to_string(),
            ));
        }
    }
    Ok((private, shared))
}

fn ensure_store_uuid(conn: &Connection, scope: StoreScope) -> StoreResult<Uuid> {
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {}.store_metadata (key, value) VALUES (?1, ?2);",
            scope.schema()
        ),
        params![STORE_UUID_KEY, Uuid::new_v4().to_string()],
    )?;
    let text = read_metadata(conn, scope, STORE_UUID_KEY)?.unwrap_or_default();
    Uuid::parse_str(&text).map_err(|_| {
        StoreError::InvalidData(format!("invalid store uuid `{text}` in {}", scope.as_str()))
    })
}

fn read_metadata(conn: &Connection, scope: StoreScope, key: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row(
            &format!(
                "SELECT value FROM {}.store_metadata WHERE key = ?1;",
                scope.schema()
            ),
            [key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

fn write_metadata(conn: &Connection, scope: StoreScope, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO {}.store_metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            scope.schema()
        ),
        params![key, value],
    )?;
    Ok(())
}

fn delete_entity_rows(conn: &mut Connection, scopes: &[StoreScope], entity: &str) -> StoreResult<usize> {
    let tx = conn.transaction()?;
    let mut removed = 0usize;
    for scope in scopes {
        let schema = scope.schema();
        tx.execute(
            &format!(
                "INSERT INTO {schema}.change_log (entity, id, op, origin)
                 SELECT entity, id, 'delete', 'local' FROM {schema}.records WHERE entity = ?1;"
            ),
            [entity],
        )?;
        removed += tx.execute(
            &format!("DELETE FROM {schema}.records WHERE entity = ?1;"),
            [entity],
        )?;
    }
    tx.commit()?;
    Ok(removed)
}

fn read_pending_changes(
    conn: &Connection,
    scope: StoreScope,
    after_seq: i64,
) -> StoreResult<(Vec<PendingChange>, i64)> {
    let schema = scope.schema();
    let mut stmt = conn.prepare(&format!(
        "SELECT seq, entity, id, op, origin FROM {schema}.change_log
         WHERE seq > ?1
         ORDER BY seq ASC;"
    ))?;
    let mut rows = stmt.query([after_seq])?;

    let mut last_seq = after_seq;
    let mut latest: BTreeMap<(String, EntityId), (i64, ChangeOp)> = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let seq: i64 = row.get(0)?;
        last_seq = last_seq.max(seq);
        let origin: String = row.get(4)?;
        if origin != ChangeOrigin::Local.as_db() {
            continue;
        }
        let entity: String = row.get(1)?;
        let id = parse_uuid(&row.get::<_, String>(2)?)?;
        let op_text: String = row.get(3)?;
        let op = ChangeOp::parse(&op_text).ok_or_else(|| {
            StoreError::InvalidData(format!("invalid change op `{op_text}` in change_log.op"))
        })?;
        latest.insert((entity, id), (seq, op));
    }
    drop(rows);

    let mut changes = Vec::with_capacity(latest.len());
    for ((entity, id), (seq, op)) in latest {
        let record = match op {
            ChangeOp::Upsert => read_record(conn, scope, &entity, id)?,
            ChangeOp::Delete => None,
        };
        // An upsert whose row is gone was deleted by a later non-local write.
        let op = if record.is_none() { ChangeOp::Delete } else { op };
        changes.push(PendingChange {
            seq,
            entity,
            id,
            op,
            record,
        });
    }
    changes.sort_by_key(|change| change.seq);
    Ok((changes, last_seq))
}

/// Selects records of one entity across `scopes`, honoring the request's
/// predicate, ordering, limit and offset.
pub(super) fn select_records(
    conn: &Connection,
    scopes: &[StoreScope],
    request: &FetchRequest,
) -> StoreResult<Vec<(StoreScope, Record)>> {
    let mut sql =
        String::from("SELECT entity, id, attributes, version, zone, created_at, scope FROM (");
    let mut binds: Vec<SqlValue> = Vec::new();
    let all = Predicate::All;

    for (index, scope) in scopes.iter().enumerate() {
        if index > 0 {
            sql.push_str(" UNION ALL ");
        }
        sql.push_str(&format!(
            "SELECT entity, id, attributes, version, zone, created_at, '{}' AS scope
             FROM {}.records WHERE entity = ? AND (",
            scope.as_str(),
            scope.schema()
        ));
        binds.push(SqlValue::Text(request.entity.clone()));
        request
            .predicate
            .as_ref()
            .unwrap_or(&all)
            .write_sql(&mut sql, &mut binds);
        sql.push(')');
    }
    sql.push(')');
    request.write_tail(&mut sql, &mut binds);

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(binds))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let scope = match row.get::<_, String>("scope")?.as_str() {
            "shared" => StoreScope::Shared,
            _ => StoreScope::Private,
        };
        records.push((scope, parse_record_row(row)?));
    }
    Ok(records)
}

pub(super) fn read_record(
    conn: &Connection,
    scope: StoreScope,
    entity: &str,
    id: EntityId,
) -> StoreResult<Option<Record>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT entity, id, attributes, version, zone FROM {}.records
         WHERE entity = ?1 AND id = ?2;",
        scope.schema()
    ))?;
    let mut rows = stmt.query(params![entity, id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_record_row(row)?)),
        None => Ok(None),
    }
}

/// Inserts `record` with version 1.
pub(super) fn insert_row(tx: &Transaction<'_>, scope: StoreScope, record: &Record) -> StoreResult<()> {
    tx.execute(
        &format!(
            "INSERT INTO {}.records (entity, id, attributes, version, zone)
             VALUES (?1, ?2, ?3, 1, ?4);",
            scope.schema()
        ),
        params![
            record.entity,
            record.id.to_string(),
            serde_json::to_string(&record.attributes)?,
            record.zone.as_deref(),
        ],
    )?;
    Ok(())
}

/// Replaces the attributes of an existing row and bumps its version.
pub(super) fn overwrite_row(tx: &Transaction<'_>, scope: StoreScope, record: &Record) -> StoreResult<()> {
    tx.execute(
        &format!(
            "UPDATE {}.records
             SET
                attributes = ?3,
                version = version + 1,
                zone = coalesce(?4, zone),
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE entity = ?1 AND id = ?2;",
            scope.schema()
        ),
        params![
            record.entity,
            record.id.to_string(),
            serde_json::to_string(&record.attributes)?,
            record.zone.as_deref(),
        ],
    )?;
    Ok(())
}

pub(super) fn delete_row(tx: &Transaction<'_>, scope: StoreScope, entity: &str, id: EntityId) -> StoreResult<bool> {
    let removed = tx.execute(
        &format!(
            "DELETE FROM {}.records WHERE entity = ?1 AND id = ?2;",
            scope.schema()
        ),
        params![entity, id.to_string()],
    )?;
    Ok(removed > 0)
}

pub(super) fn log_change(
    tx: &Transaction<'_>,
    scope: StoreScope,
    entity: &str,
    id: EntityId,
    op: ChangeOp,
    origin: ChangeOrigin,
) -> StoreResult<()> {
    tx.execute(
        &format!(
            "INSERT INTO {}.change_log (entity, id, op, origin) VALUES (?1, ?2, ?3, ?4);",
            scope.schema()
        ),
        params![entity, id.to_string(), op.as_db(), origin.as_db()],
    )?;
    Ok(())
}

fn parse_record_row(row: &Row<'_>) -> StoreResult<Record> {
    let id = parse_uuid(&row.get::<_, String>("id")?)?;
    let attributes_text: String = row.get("attributes")?;
    let attributes = match serde_json::from_str(&attributes_text)? {
        serde_json::Value::Object(map) => map,
        _ => {
            return Err(StoreError::InvalidData(format!(
                "records.attributes for `{id}` is not a JSON object"
            )))
        }
    };

    Ok(Record {
        entity: row.get("entity")?,
        id,
        attributes,
        version: row.get("version")?,
        zone: row.get("zone")?,
    })
}

fn parse_uuid(text: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(text)
        .map_err(|_| StoreError::InvalidData(format!("invalid uuid value `{text}` in records.id")))
}

#[cfg(test)]
mod tests {
    use super::LocalStore;
    use crate::model::schema::{EntityDescription, Schema};
    use crate::store::{Context, StoreDescriptor, StoreLocation, StoreScope};
    use serde::{Deserialize, Serialize};
    use crate::model::entity::ManagedEntity;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Account {
        id: Uuid,
        name: String,
    }

    impl ManagedEntity for Account {
        const ENTITY_NAME: &'static str = "Account";

        fn id(&self) -> Uuid {
            self.id
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Category {
        id: Uuid,
        label: String,
    }

    impl ManagedEntity for Category {
        const ENTITY_NAME: &'static str = "Category";

        fn id(&self) -> Uuid {
            self.id
        }
    }

    fn memory_store() -> LocalStore {
        let private = StoreDescriptor::private(StoreLocation::InMemory);
        let shared = private.shared_copy(StoreLocation::InMemory);
        let schema = Schema::new(
            "Budget",
            vec![EntityDescription::new("Account"), EntityDescription::new("Category")],
        )
        .unwrap();
        LocalStore::try_open(vec![private, shared], schema).unwrap()
    }

    async fn seed(context: &Context) {
        for name in ["cash", "card"] {
            context
                .insert(&Account {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                })
                .await
                .unwrap();
        }
        context
            .insert(&Category {
                id: Uuid::new_v4(),
                label: "food".to_string(),
            })
            .await
            .unwrap();
        assert!(context.save_if_needed().await.unwrap());
    }

    #[tokio::test]
    async fn reset_all_continues_past_a_failing_kind() {
        let store = memory_store();
        let context = store.main_context();
        seed(&context).await;

        store
            .inner
            .run(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER block_account_delete BEFORE DELETE ON records
                     WHEN old.entity = 'Account'
                     BEGIN SELECT RAISE(ABORT, 'account rows are locked'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        store.reset_all().await.unwrap();
        assert_eq!(store.count("Account").await.unwrap(), 2);
        assert_eq!(store.count("Category").await.unwrap(), 0);

        store
            .inner
            .run(|conn| {
                conn.execute_batch("DROP TRIGGER block_account_delete;")?;
                Ok(())
            })
            .await
            .unwrap();

        store.reset_all().await.unwrap();
        assert_eq!(store.count("Account").await.unwrap(), 0);
        assert_eq!(store.count("Category").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn local_writes_are_pending_for_export_and_remote_writes_are_not() {
        let store = memory_store();
        seed(&store.main_context()).await;

        let (changes, last_seq) = store.pending_changes(StoreScope::Private, 0).await.unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(last_seq, 3);

        let remote = crate::model::entity::Record::from_entity(&Account {
            id: Uuid::new_v4(),
            name: "remote".to_string(),
        })
        .unwrap();
        let written = store
            .apply_remote_changes(
                StoreScope::Private,
                None,
                super::RemoteChanges {
                    upserts: vec![remote],
                    deletions: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(written, 1);

        let (changes, last_seq) = store
            .pending_changes(StoreScope::Private, 3)
            .await
            .unwrap();
        assert!(changes.is_empty());
        assert_eq!(last_seq, 4);
    }

    #[tokio::test]
    async fn store_ids_are_stable_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let open = || {
            let private =
                StoreDescriptor::private(StoreLocation::File(dir.path().join("Budget.sqlite")));
            let shared =
                private.shared_copy(StoreLocation::File(dir.path().join("Budget.shared.sqlite")));
            let schema = Schema::new("Budget", vec![EntityDescription::new("Account")]).unwrap();
            LocalStore::try_open(vec![private, shared], schema).unwrap()
        };

        let first = open();
        let private_id = first.store_id(StoreScope::Private).unwrap();
        let shared_id = first.store_id(StoreScope::Shared).unwrap();
        assert_ne!(private_id, shared_id);
        drop(first);

        let second = open();
        assert_eq!(second.store_id(StoreScope::Private), Some(private_id));
        assert_eq!(second.store_id(StoreScope::Shared), Some(shared_id));
    }

    #[test]
    fn rejects_missing_private_descriptor() {
        let shared = StoreDescriptor::private(StoreLocation::InMemory)
            .shared_copy(StoreLocation::InMemory);
        let schema = Schema::new("Budget", vec![EntityDescription::new("Account")]).unwrap();
        assert!(LocalStore::try_open(vec![shared], schema).is_err());
    }
}
