//! Flat key→blob store contract the assembler writes through.
//!
//! A store holds one value per key plus an optional manifest attached as
//! metadata. Absence is reported as `Ok(None)`, never as an error, so the
//! caller can tell a definitive miss from a transient fault.

mod filesystem;
mod memory;

pub use filesystem::FilesystemChunkStore;
pub use memory::MemoryChunkStore;

use crate::models::Manifest;
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, path::Path, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("metadata encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Faults worth retrying at the point of failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A value together with the metadata stored alongside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Bytes,
    pub metadata: Option<Manifest>,
}

#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Store `value` under `key`, replacing any previous value and metadata.
    async fn put(&self, key: &str, value: Bytes, metadata: Option<Manifest>) -> StoreResult<()>;

    /// Fetch a value without its metadata.
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Fetch a value and its metadata in one round trip.
    async fn get_with_metadata(&self, key: &str) -> StoreResult<Option<StoredValue>>;

    /// Remove a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Static backend identifier used in logs.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable.
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Which backend to construct at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreBackend {
    Filesystem,
    Memory,
}

/// Build the configured chunk store.
pub async fn from_config(
    backend: StoreBackend,
    storage_dir: impl AsRef<Path>,
) -> StoreResult<Arc<dyn ChunkStore>> {
    match backend {
        StoreBackend::Filesystem => Ok(Arc::new(FilesystemChunkStore::new(storage_dir).await?)),
        StoreBackend::Memory => Ok(Arc::new(MemoryChunkStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(StoreError::Io(io::Error::other("reset")).is_transient());
        assert!(!StoreError::InvalidKey("../x".into()).is_transient());
    }

    #[tokio::test]
    async fn from_config_memory_round_trips() {
        let store = from_config(StoreBackend::Memory, "unused").await.unwrap();
        store.put("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(store.backend_name(), "memory");
    }
}
