//! Storage implementations.
//!
//! Local read-model persistence for materialized identities. The store only
//! needs point lookup and upsert; idempotency is the materializer's job.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

pub use crate::config::{StorageConfig, StorageType};
use crate::materializer::IdentityRecord;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryIdentityStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteIdentityStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported storage: {0}")]
    Unsupported(String),
}

/// Persistence collaborator for identity read models.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up the local record for a subject.
    async fn find_by_id(&self, id: &str) -> Result<Option<IdentityRecord>>;

    /// Insert or replace the record keyed by `record.id`.
    async fn upsert(&self, record: &IdentityRecord) -> Result<()>;
}

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn IdentityStore>> {
    match config.storage_type {
        StorageType::Memory => {
            info!("Storage: memory");
            Ok(Arc::new(MemoryIdentityStore::new()))
        }
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            info!("Storage: sqlite at {}", config.path);

            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                }
            }

            // every connection to `sqlite::memory:` is a separate database
            let in_memory = config.path == ":memory:";
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(if in_memory { 1 } else { 5 })
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(&config.sqlite_url())
                .await?;
            let store = SqliteIdentityStore::new(pool);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err(StorageError::Unsupported(
                "sqlite feature not enabled".to_string(),
            ))
        }
    }
}
