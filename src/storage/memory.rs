//! In-memory IdentityStore.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::materializer::IdentityRecord;
use crate::storage::{IdentityStore, Result, StorageError};

/// Identity store that keeps records in memory.
#[derive(Default)]
pub struct MemoryIdentityStore {
    records: RwLock<HashMap<String, IdentityRecord>>,
    unavailable: RwLock<bool>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail, as if the backing store were down.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn check_available(&self) -> Result<()> {
        if *self.unavailable.read().await {
            return Err(StorageError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<IdentityRecord>> {
        self.check_available().await?;
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn upsert(&self, record: &IdentityRecord) -> Result<()> {
        self.check_available().await?;
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }
}
