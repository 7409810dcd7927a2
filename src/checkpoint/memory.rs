//! In-memory checkpoint store for tests and embedded use.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;

use super::{CheckpointData, CheckpointStore};

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, CheckpointData>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, job_name: &str, data: &CheckpointData) -> Result<(), StoreError> {
        let mut map = self.checkpoints.write().await;
        map.entry(job_name.to_string())
            .or_insert_with(CheckpointData::new)
            .merge(data);
        Ok(())
    }

    async fn load(&self, job_name: &str) -> Result<Option<CheckpointData>, StoreError> {
        Ok(self.checkpoints.read().await.get(job_name).cloned())
    }

    async fn clear(&self, job_name: &str) -> Result<(), StoreError> {
        self.checkpoints.write().await.remove(job_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_merges_into_existing_checkpoint() {
        let store = MemoryCheckpointStore::new();

        let mut first = CheckpointData::new();
        first.set("outer", json!(5));
        first.set_recovery_mode(true);
        store.save("sync-a", &first).await.unwrap();

        let mut second = CheckpointData::new();
        second.set("inner", json!(12));
        store.save("sync-a", &second).await.unwrap();

        let loaded = store.load("sync-a").await.unwrap().unwrap();
        assert_eq!(loaded.get_u64("outer"), Some(5));
        assert_eq!(loaded.get_u64("inner"), Some(12));
        assert!(loaded.recovery_mode());
    }

    #[tokio::test]
    async fn clear_removes_the_checkpoint() {
        let store = MemoryCheckpointStore::new();
        let mut cp = CheckpointData::new();
        cp.set("outer", json!(1));
        store.save("sync-a", &cp).await.unwrap();

        store.clear("sync-a").await.unwrap();
        assert!(store.load("sync-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_missing_job_is_none() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("never-saved").await.unwrap().is_none());
    }
}
