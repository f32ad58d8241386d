use super::{ChunkStore, StoreResult, StoredValue};
use crate::models::Manifest;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Process-local store, used for tests and single-node demos.
#[derive(Default)]
pub struct MemoryChunkStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, key: &str, value: Bytes, metadata: Option<Manifest>) -> StoreResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), StoredValue { value, metadata });
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.entries.read().await.get(key).map(|v| v.value.clone()))
    }

    async fn get_with_metadata(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRef;

    #[tokio::test]
    async fn metadata_travels_with_value() {
        let store = MemoryChunkStore::new();
        let manifest = Manifest::new(vec![ChunkRef {
            object_id: "a/000000".into(),
            chunk_id: 0,
            size: 1,
        }]);
        store
            .put("a", Bytes::new(), Some(manifest.clone()))
            .await
            .unwrap();

        let stored = store.get_with_metadata("a").await.unwrap().unwrap();
        assert_eq!(stored.metadata, Some(manifest));
        assert!(stored.value.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryChunkStore::new();
        store.put("a", Bytes::from_static(b"x"), None).await.unwrap();
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }
}
