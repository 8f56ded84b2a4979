use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stfoundation_core::{
    configure, DirectoryRemoteDatabase, EntityDescription, Loader, LocalStore, ManagedEntity, MemoryRemoteDatabase,
    Predicate, RecordLoader, RemoteDatabase, RemoteQuery, Schema, StoreDescriptor, StoreLocation, StoreScope,
    SyncMirror,
};
use uuid::Uuid;

const CONTAINER: &str = "iCloud.com.example.recipes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Recipe {
    id: Uuid,
    title: String,
    servings: i64,
}

impl ManagedEntity for Recipe {
    const ENTITY_NAME: &'static str = "Recipe";

    fn id(&self) -> Uuid {
        self.id
    }
}

fn recipe(title: &str, servings: i64) -> Recipe {
    Recipe {
        id: Uuid::new_v4(),
        title: title.to_string(),
        servings,
    }
}

fn open_store(mirrored: bool) -> LocalStore {
    let private = configure(StoreDescriptor::private(StoreLocation::InMemory), CONTAINER, mirrored);
    let shared = configure(private.shared_copy(StoreLocation::InMemory), CONTAINER, mirrored);
    let schema = Schema::new("Recipes", vec![EntityDescription::new("Recipe")]).unwrap();
    LocalStore::try_open(vec![private, shared], schema).unwrap()
}

#[tokio::test]
async fn purge_after_enabling_the_mirror_empties_the_local_store() {
    let store = open_store(false);
    let remote = Arc::new(MemoryRemoteDatabase::signed_in(CONTAINER, "alice"));
    let mirror = SyncMirror::new(store.clone(), remote.clone(), false);
    let loader = RecordLoader::<Recipe>::new(store.main_context());

    loader
        .insert(&[recipe("soup", 4), recipe("bread", 8), recipe("salad", 2)])
        .await
        .unwrap();
    assert_eq!(loader.list(None).await.unwrap().len(), 3);
    assert_eq!(mirror.push_pending().await.unwrap(), 0);
    assert_eq!(remote.record_count(StoreScope::Private).await, 0);

    mirror.set_enabled(true);
    assert_eq!(mirror.push_pending().await.unwrap(), 3);
    assert_eq!(remote.record_count(StoreScope::Private).await, 3);

    mirror.purge_remote().await.unwrap();
    assert_eq!(store.count("Recipe").await.unwrap(), 0);
    assert!(loader.list(None).await.unwrap().is_empty());
    assert_eq!(remote.record_count(StoreScope::Private).await, 0);

    // Nothing left to export and nothing to bring back.
    assert_eq!(mirror.push_pending().await.unwrap(), 0);
    assert_eq!(mirror.pull().await.unwrap(), 0);
    assert_eq!(store.count("Recipe").await.unwrap(), 0);
}

#[tokio::test]
async fn purge_still_resets_locally_when_the_remote_is_unreachable() {
    let store = open_store(true);
    let remote = Arc::new(MemoryRemoteDatabase::signed_in(CONTAINER, "alice"));
    let mirror = SyncMirror::new(store.clone(), remote.clone(), true);
    let loader = RecordLoader::<Recipe>::new(store.main_context());
    loader.insert(&[recipe("soup", 4)]).await.unwrap();

    remote.set_reachable(false).await;
    assert!(mirror.purge_remote().await.is_err());
    assert_eq!(store.count("Recipe").await.unwrap(), 0);
}

#[tokio::test]
async fn remote_record_check_distinguishes_match_miss_and_failure() {
    let store = open_store(true);
    let remote = Arc::new(MemoryRemoteDatabase::signed_in(CONTAINER, "alice"));
    let mirror = SyncMirror::new(store.clone(), remote.clone(), true);
    let loader = RecordLoader::<Recipe>::new(store.main_context());
    loader.insert(&[recipe("soup", 4)]).await.unwrap();
    mirror.push_pending().await.unwrap();

    let soup = RemoteQuery::new("Recipe", Predicate::eq("title", "soup"));
    let cake = RemoteQuery::new("Recipe", Predicate::eq("title", "cake"));
    assert_eq!(mirror.has_remote_records(&soup).await, Some(true));
    assert_eq!(mirror.has_remote_records(&cake).await, None);

    remote.set_reachable(false).await;
    assert_eq!(mirror.has_remote_records(&soup).await, Some(false));
}

#[tokio::test]
async fn directory_remote_carries_changes_between_devices() {
    let remote_root = tempfile::tempdir().unwrap();
    let remote: Arc<dyn RemoteDatabase> = {
        let directory = DirectoryRemoteDatabase::new(remote_root.path(), CONTAINER);
        directory.sign_in("alice").await.unwrap();
        Arc::new(directory)
    };

    let phone = open_store(true);
    let laptop = open_store(true);
    let phone_mirror = SyncMirror::new(phone.clone(), remote.clone(), true);
    let laptop_mirror = SyncMirror::new(laptop.clone(), remote.clone(), true);
    let on_phone = RecordLoader::<Recipe>::new(phone.main_context());
    let mut on_laptop = RecordLoader::<Recipe>::new(laptop.main_context());

    let mut soup = recipe("soup", 4);
    let bread = recipe("bread", 8);
    on_phone.insert(&[soup.clone(), bread.clone()]).await.unwrap();
    assert_eq!(phone_mirror.push_pending().await.unwrap(), 2);
    assert_eq!(laptop_mirror.pull().await.unwrap(), 2);
    assert_eq!(on_laptop.list(None).await.unwrap().len(), 2);

    soup.servings = 6;
    on_laptop.update(&soup).await.unwrap();
    on_laptop.delete(&bread).await.unwrap();
    assert_eq!(laptop_mirror.push_pending().await.unwrap(), 2);

    phone_mirror.pull().await.unwrap();
    assert_eq!(on_phone.list(None).await.unwrap(), vec![soup.clone()]);

    // Pulling again with unchanged zone tokens writes nothing.
    assert_eq!(phone_mirror.pull().await.unwrap(), 0);
    assert_eq!(
        on_laptop.get(Some(Predicate::id(soup.id))).await.unwrap().servings,
        6
    );
}

#[tokio::test]
async fn observer_pushes_after_context_saves() {
    let store = open_store(true);
    let remote = Arc::new(MemoryRemoteDatabase::signed_in(CONTAINER, "alice"));
    let mirror = SyncMirror::new(store.clone(), remote.clone(), true);
    let handle = mirror.observe();
    let loader = RecordLoader::<Recipe>::new(store.background_context());

    loader.insert(&[recipe("soup", 4)]).await.unwrap();
    let mut synced = false;
    for _ in 0..50 {
        if remote.record_count(StoreScope::Private).await == 1 {
            synced = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(synced, "observer never pushed the saved recipe");

    drop(mirror);
    handle.abort();
}
