use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quire::application::migrations::{
    IndexMigration, MIGRATIONS_DB, Migration, MigrationError, MigrationRunner, builtin,
};
use quire::infra::docstore::{DocumentStore, MemoryDocumentStore};
use quire::infra::kv::{KeyValueStore, MemoryStore, StoreError, keys};

fn runner(store: &MemoryDocumentStore) -> MigrationRunner {
    MigrationRunner::new(Arc::new(store.handle()), builtin())
}

async fn index_names(store: &MemoryDocumentStore, db: &str) -> Vec<String> {
    store
        .list_indexes(db)
        .await
        .unwrap()
        .into_iter()
        .map(|index| index.name)
        .collect()
}

#[tokio::test]
async fn migrate_is_idempotent_and_keeps_timestamps() {
    let store = MemoryDocumentStore::new();
    let runner = runner(&store);

    let first = runner.migrate().await.unwrap();
    assert_eq!(
        first.applied,
        vec![
            "001_initial_indexes",
            "002_add_view_count_index",
            "003_add_reading_time_index",
            "004_add_contact_indexes",
        ]
    );
    assert_eq!(first.skipped, 0);
    let before = runner.status().await.unwrap();

    let second = runner.migrate().await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped, 4);

    let after = runner.status().await.unwrap();
    assert_eq!(before, after);
    assert!(after.iter().all(|status| status.applied && status.applied_at.is_some()));

    assert!(store.database_exists(MIGRATIONS_DB).await.unwrap());
    assert_eq!(store.all_docs(MIGRATIONS_DB).await.unwrap().len(), 4);
    assert!(index_names(&store, "posts").await.contains(&"tags-index".to_string()));
}

#[tokio::test]
async fn rollback_reverts_only_the_latest_migration() {
    let store = MemoryDocumentStore::new();
    let runner = runner(&store);
    runner.migrate().await.unwrap();

    let rolled_back = runner.rollback().await.unwrap();
    assert_eq!(rolled_back.as_deref(), Some("004_add_contact_indexes"));

    let status = runner.status().await.unwrap();
    let applied: Vec<_> = status
        .iter()
        .filter(|status| status.applied)
        .map(|status| status.version.as_str())
        .collect();
    assert_eq!(
        applied,
        vec![
            "001_initial_indexes",
            "002_add_view_count_index",
            "003_add_reading_time_index",
        ]
    );

    let contacts = index_names(&store, "contacts").await;
    assert!(!contacts.contains(&"email-status-index".to_string()));
    assert!(contacts.contains(&"status-created-index".to_string()));

    let reapplied = runner.migrate().await.unwrap();
    assert_eq!(reapplied.applied, vec!["004_add_contact_indexes"]);
}

#[tokio::test]
async fn rollback_with_nothing_applied_is_a_no_op() {
    let store = MemoryDocumentStore::new();
    assert_eq!(runner(&store).rollback().await.unwrap(), None);
}

#[tokio::test]
async fn lease_is_released_after_a_run_and_blocks_while_held() {
    let store = MemoryDocumentStore::new();
    let kv = Arc::new(MemoryStore::new());
    let runner = runner(&store).with_lease(kv.clone());

    runner.migrate().await.unwrap();
    let lock = keys::app_state("migration_lock");
    assert!(!kv.exists(&lock).await.unwrap());

    let other = MigrationRunner::new(
        Arc::new(store.handle()),
        vec![Arc::new(
            IndexMigration::new("005_extra", "extra index").index("posts", "extra-index", &["slug"]),
        ) as Arc<dyn Migration>],
    )
    .with_lease(kv.clone());

    kv.increment_with_ttl(&lock, Duration::from_secs(300))
        .await
        .unwrap();
    assert!(matches!(other.migrate().await, Err(MigrationError::Locked)));
    assert!(kv.exists(&lock).await.unwrap(), "held lease is left alone");

    kv.delete(&lock).await.unwrap();
    assert_eq!(other.migrate().await.unwrap().applied, vec!["005_extra"]);
}

struct DownStore;

#[async_trait]
impl KeyValueStore for DownStore {
    async fn set_with_ttl(&self, _: &str, _: Bytes, _: Duration) -> Result<(), StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn get(&self, _: &str) -> Result<Option<Bytes>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn delete(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn exists(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn increment_by_with_ttl(&self, _: &str, _: u64, _: Duration) -> Result<u64, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn delete_by_pattern(&self, _: &str) -> Result<u64, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn ttl_remaining(&self, _: &str) -> Result<Option<Duration>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn publish(&self, _: &str, _: Bytes) -> Result<u64, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    async fn key_count(&self) -> Result<u64, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
    fn backend(&self) -> &'static str {
        "down"
    }
}

#[tokio::test]
async fn startup_migrates_without_the_lease_when_the_store_is_down() {
    let store = MemoryDocumentStore::new();
    let runner = runner(&store).with_lease(Arc::new(DownStore));

    assert!(matches!(runner.migrate().await, Err(MigrationError::Lease(_))));

    let outcome = runner
        .migrate_at_startup()
        .await
        .unwrap()
        .expect("migrations run without the lease");
    assert_eq!(outcome.applied.len(), 4);
    assert!(runner.status().await.unwrap().iter().all(|status| status.applied));
}

#[tokio::test]
async fn startup_skips_migrations_while_another_instance_holds_the_lease() {
    let store = MemoryDocumentStore::new();
    let kv = Arc::new(MemoryStore::new());
    let lock = keys::app_state("migration_lock");
    kv.increment_with_ttl(&lock, Duration::from_secs(300))
        .await
        .unwrap();

    let runner = runner(&store).with_lease(kv.clone());
    assert_eq!(runner.migrate_at_startup().await.unwrap(), None);
    assert!(!store.database_exists(MIGRATIONS_DB).await.unwrap());
    assert!(kv.exists(&lock).await.unwrap(), "held lease is left alone");
}

#[tokio::test]
async fn startup_still_fails_on_a_broken_migration() {
    let store = MemoryDocumentStore::new();
    store.simulate_outage(true);
    let runner = runner(&store).with_lease(Arc::new(DownStore));
    assert!(runner.migrate_at_startup().await.is_err());
}
