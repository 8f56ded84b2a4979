use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use stfoundation_core::{
    ConfigProvider, Loader, ManagedEntity, MemoryRemoteDatabase, PersistenceStack, Predicate, StackError,
    StoreConfig,
};
use uuid::Uuid;

const MODEL_JSON: &str = r#"{
    "name": "Budget",
    "entities": [
        {
            "name": "Expense",
            "attributes": [
                { "name": "title", "kind": "string" },
                { "name": "amount_cents", "kind": "integer" }
            ]
        }
    ]
}"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Expense {
    id: Uuid,
    title: String,
    amount_cents: i64,
}

impl ManagedEntity for Expense {
    const ENTITY_NAME: &'static str = "Expense";

    fn id(&self) -> Uuid {
        self.id
    }
}

fn config(root: &Path, use_remote_mirror: bool) -> Arc<dyn ConfigProvider> {
    Arc::new(StoreConfig {
        use_remote_mirror,
        store_container_name: "Budget".to_string(),
        app_bundle_id: "com.example.budget".to_string(),
        app_group_id: "group.com.example.budget".to_string(),
        remote_container_id: "iCloud.com.example.budget".to_string(),
        group_container_root: root.join("containers"),
        model_dir: root.join("models"),
        remote_directory: None,
    })
}

fn write_model(root: &Path) {
    std::fs::create_dir_all(root.join("models")).unwrap();
    std::fs::write(root.join("models").join("Budget.model.json"), MODEL_JSON).unwrap();
}

#[tokio::test]
async fn loaded_stack_serves_loaders_and_settings() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());
    let config = config(dir.path(), true);
    let remote = Arc::new(MemoryRemoteDatabase::signed_in("iCloud.com.example.budget", "alice"));

    let stack = PersistenceStack::try_load_with_remote(config.clone(), remote)
        .await
        .unwrap();
    assert!(stack.mirror().is_enabled());
    assert!(config.private_store_path().is_file());
    assert!(config.settings_path().is_file());

    let rent = Expense {
        id: Uuid::new_v4(),
        title: "rent".to_string(),
        amount_cents: 90_000,
    };
    stack.loader::<Expense>().insert(std::slice::from_ref(&rent)).await.unwrap();
    let mut background = stack.background_loader::<Expense>();
    assert_eq!(background.get(Some(Predicate::id(rent.id))).await.unwrap(), rent);

    stack.settings().set_setting("budget.currency", "EUR").unwrap();
    assert_eq!(stack.settings().get_setting("budget.currency", String::new()), "EUR");
}

#[tokio::test]
async fn mirroring_stays_off_without_an_account() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());
    let remote = Arc::new(MemoryRemoteDatabase::new("iCloud.com.example.budget"));

    let stack = PersistenceStack::try_load_with_remote(config(dir.path(), true), remote.clone())
        .await
        .unwrap();
    assert!(!stack.mirror().is_enabled());
    assert!(!stack.reinitiate().await);

    remote.sign_in("alice").await;
    assert!(stack.reinitiate().await);
    assert!(stack.mirror().is_enabled());
}

#[tokio::test]
async fn mirroring_stays_off_when_the_config_disables_it() {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());
    let remote = Arc::new(MemoryRemoteDatabase::signed_in("iCloud.com.example.budget", "alice"));

    let stack = PersistenceStack::try_load_with_remote(config(dir.path(), false), remote)
        .await
        .unwrap();
    assert!(!stack.mirror().is_enabled());
    assert!(!stack.reinitiate().await);
}

#[tokio::test]
async fn missing_model_is_reported_by_try_load() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemoteDatabase::new("iCloud.com.example.budget"));

    let result = PersistenceStack::try_load_with_remote(config(dir.path(), false), remote).await;
    assert!(matches!(result, Err(StackError::Schema(_))));
}

#[tokio::test]
#[should_panic(expected = "unresolved error loading persistence stack")]
async fn load_panics_when_the_model_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemoteDatabase::new("iCloud.com.example.budget"));
    PersistenceStack::load_with_remote(config(dir.path(), false), remote).await;
}
