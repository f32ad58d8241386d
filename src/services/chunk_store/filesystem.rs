//! Disk-backed chunk store.
//!
//! Each key maps to one file beneath `root/{shard}/{shard}/{encoded key}`.
//! Manifests live in a `.meta.json` sidecar next to the value file.

use super::{ChunkStore, StoreError, StoreResult, StoredValue};
use crate::models::Manifest;
use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_KEY_LEN: usize = 512;
const META_SUFFIX: &str = ".meta.json";

pub struct FilesystemChunkStore {
    root: PathBuf,
}

impl FilesystemChunkStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Reject keys that are empty, oversized, absolute, or contain traversal
    /// or control characters.
    fn ensure_key_safe(key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(StoreError::InvalidKey(format!("bad length: {}", key.len())));
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Two-level shard directories from MD5(key), 00 to ff each.
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Value file path. Keys are percent-encoded into a single file name so
    /// `abc` and `abc/000001` never compete for the same path.
    fn value_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.root.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(utf8_percent_encode(key, NON_ALPHANUMERIC).to_string());
        path
    }

    fn meta_path(value_path: &Path) -> PathBuf {
        let mut name = value_path.as_os_str().to_owned();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    /// Write `data` to a temp file in `dir`, fsync it, then rename onto `target`.
    async fn write_atomic(dir: &Path, target: &Path, data: &[u8]) -> StoreResult<()> {
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, target).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        Ok(())
    }

    async fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn remove_optional(path: &Path) -> StoreResult<()> {
        match fs::remove_file(path).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Remove empty shard directories up to, but not including, the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ChunkStore for FilesystemChunkStore {
    async fn put(&self, key: &str, value: Bytes, metadata: Option<Manifest>) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let value_path = self.value_path(key);
        let parent = value_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(&parent).await?;

        // The sidecar lands before the value so a reader never sees a root
        // value without the manifest that belongs to it.
        let meta_path = Self::meta_path(&value_path);
        match metadata {
            Some(manifest) => {
                let encoded = serde_json::to_vec(&manifest)?;
                Self::write_atomic(&parent, &meta_path, &encoded).await?;
            }
            None => Self::remove_optional(&meta_path).await?,
        }

        Self::write_atomic(&parent, &value_path, &value).await?;
        debug!(key, bytes = value.len(), "stored value");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Self::ensure_key_safe(key)?;
        Ok(Self::read_optional(&self.value_path(key))
            .await?
            .map(Bytes::from))
    }

    async fn get_with_metadata(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        Self::ensure_key_safe(key)?;
        let value_path = self.value_path(key);
        let Some(value) = Self::read_optional(&value_path).await? else {
            return Ok(None);
        };
        let metadata = match Self::read_optional(&Self::meta_path(&value_path)).await? {
            Some(raw) => Some(serde_json::from_slice::<Manifest>(&raw)?),
            None => None,
        };
        Ok(Some(StoredValue {
            value: Bytes::from(value),
            metadata,
        }))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        Self::ensure_key_safe(key)?;
        let value_path = self.value_path(key);
        Self::remove_optional(&value_path).await?;
        Self::remove_optional(&Self::meta_path(&value_path)).await?;
        if let Some(parent) = value_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    /// Best-effort write/read/delete of a probe file under the root.
    async fn health_check(&self) -> StoreResult<()> {
        let probe = self.root.join(format!(".health-{}", Uuid::new_v4()));
        fs::write(&probe, b"health").await?;
        let read_back = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read_back? != b"health" {
            return Err(StoreError::Unavailable("probe content mismatch".into()));
        }
        Ok(())
    }
}
