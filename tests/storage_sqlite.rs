//! SQLite storage integration tests.
//!
//! Run with: cargo test --test storage_sqlite --features sqlite
//!
//! Uses an in-memory database by default, no external dependencies required.

mod storage;

use courier::config::{StorageConfig, StorageType};
use courier::storage::{init_storage, IdentityStore, MemoryIdentityStore, SqliteIdentityStore};
use sqlx::sqlite::SqlitePoolOptions;

/// Get SQLite connection string (in-memory for tests)
fn sqlite_uri() -> String {
    std::env::var("SQLITE_URI").unwrap_or_else(|_| "sqlite::memory:".to_string())
}

async fn cleanup_identities(pool: &sqlx::SqlitePool) {
    let _ = sqlx::query("DELETE FROM identities WHERE id LIKE 'test_%'")
        .execute(pool)
        .await;
}

async fn connect_and_init() -> (sqlx::SqlitePool, SqliteIdentityStore) {
    // One connection: every in-memory connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(&sqlite_uri())
        .await
        .expect("Failed to connect to SQLite");

    let store = SqliteIdentityStore::new(pool.clone());
    store.init().await.expect("Failed to create schema");
    // Schema creation must be repeatable.
    store.init().await.expect("Failed to re-run schema creation");

    (pool, store)
}

#[tokio::test]
async fn test_sqlite_identity_store() {
    println!("=== SQLite IdentityStore Tests ===");
    println!("Connecting to: {}", sqlite_uri());

    let (pool, store) = connect_and_init().await;

    cleanup_identities(&pool).await;
    run_identity_store_tests!(&store);
    cleanup_identities(&pool).await;

    println!("=== All SQLite IdentityStore tests PASSED ===");
}

#[tokio::test]
async fn test_memory_identity_store() {
    println!("=== Memory IdentityStore Tests ===");

    let store = MemoryIdentityStore::new();
    run_identity_store_tests!(&store);

    println!("=== All Memory IdentityStore tests PASSED ===");
}

#[tokio::test]
async fn test_sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = StorageConfig {
        storage_type: StorageType::Sqlite,
        path: dir
            .path()
            .join("nested/identities.db")
            .to_string_lossy()
            .into_owned(),
    };

    let record = storage::identity_store_tests::make_record("u1", "a@b.com", "A");
    {
        let store = init_storage(&config).await.expect("open store");
        store.upsert(&record).await.expect("upsert");
    }

    let reopened: std::sync::Arc<dyn IdentityStore> =
        init_storage(&config).await.expect("reopen store");
    let found = reopened
        .find_by_id("u1")
        .await
        .expect("find")
        .expect("record persisted");
    assert_eq!(found, record);
}
