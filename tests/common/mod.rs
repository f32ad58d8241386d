use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt, stream};
use share_store::models::Manifest;
use share_store::services::{
    AssemblerOptions, CodeGenerator, Download, MemoryChunkStore, ShareService, ShareSettings,
    SqliteRecordStore,
    chunk_store::{ChunkStore, StoreError, StoreResult, StoredValue},
    retry::RetryPolicy,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Fresh in-memory record store with the schema applied.
#[allow(dead_code)]
pub async fn record_store() -> Arc<SqliteRecordStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteRecordStore::new(Arc::new(pool));
    store.migrate().await.unwrap();
    Arc::new(store)
}

#[allow(dead_code)]
pub fn options(chunk_size: usize) -> AssemblerOptions {
    AssemblerOptions {
        chunk_size,
        write_concurrency: 2,
        prefetch_depth: 2,
        max_object_size: None,
        retry: RetryPolicy::none(),
    }
}

#[allow(dead_code)]
pub async fn service(chunks: Arc<dyn ChunkStore>, chunk_size: usize) -> ShareService {
    ShareService::new(
        record_store().await,
        chunks,
        options(chunk_size),
        ShareSettings::default(),
    )
    .unwrap()
}

/// Deterministic payload of `len` bytes.
#[allow(dead_code)]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Feed `data` as a stream of `piece`-sized parts.
#[allow(dead_code)]
pub fn body(data: &[u8], piece: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let parts: Vec<io::Result<Bytes>> = data
        .chunks(piece.max(1))
        .map(|part| Ok(Bytes::copy_from_slice(part)))
        .collect();
    stream::iter(parts)
}

#[allow(dead_code)]
pub async fn drain(download: Download) -> Vec<u8> {
    let parts: Vec<Bytes> = download.body.try_collect().await.unwrap();
    parts.concat()
}

/// Chunk store wrapper that injects faults and counts calls.
#[allow(dead_code)]
pub struct FaultyChunkStore {
    inner: MemoryChunkStore,
    puts: AtomicUsize,
    fail_puts_after: AtomicUsize,
    fail_gets: AtomicUsize,
    deletes: Mutex<Vec<String>>,
    delete_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

#[allow(dead_code)]
impl FaultyChunkStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryChunkStore::new(),
            puts: AtomicUsize::new(0),
            fail_puts_after: AtomicUsize::new(usize::MAX),
            fail_gets: AtomicUsize::new(0),
            deletes: Mutex::new(Vec::new()),
            delete_gate: Mutex::new(None),
        })
    }

    /// Let `n` more puts succeed; every put after that fails.
    pub fn fail_puts_after(&self, n: usize) {
        let done = self.puts.load(Ordering::SeqCst);
        self.fail_puts_after.store(done + n, Ordering::SeqCst);
    }

    /// Fail the next `n` gets with a transient error.
    pub fn fail_next_gets(&self, n: usize) {
        self.fail_gets.store(n, Ordering::SeqCst);
    }

    /// Access the backing store directly, bypassing fault injection.
    pub fn inner(&self) -> &MemoryChunkStore {
        &self.inner
    }

    /// Hold the next delete after it lands. The first notify fires once the
    /// key is gone; the delete returns after the second is notified.
    pub fn pause_after_next_delete(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.delete_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    fn take_get_fault(&self) -> StoreResult<()> {
        let fail = self
            .fail_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::Unavailable("injected get fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for FaultyChunkStore {
    async fn put(&self, key: &str, value: Bytes, metadata: Option<Manifest>) -> StoreResult<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_puts_after.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("injected put fault on `{key}`")));
        }
        self.inner.put(key, value, metadata).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.take_get_fault()?;
        self.inner.get(key).await
    }

    async fn get_with_metadata(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        self.take_get_fault()?;
        self.inner.get_with_metadata(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        self.inner.delete(key).await?;
        let gate = self.delete_gate.lock().unwrap().take();
        if let Some((landed, resume)) = gate {
            landed.notify_one();
            resume.notified().await;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}

/// Hands out a fixed sequence of codes, then repeats the last one.
#[allow(dead_code)]
pub struct SequenceCodeGenerator {
    codes: Vec<String>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl SequenceCodeGenerator {
    pub fn new(codes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            codes: codes.iter().map(|c| c.to_string()).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CodeGenerator for SequenceCodeGenerator {
    fn generate(&self) -> String {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.codes[n.min(self.codes.len() - 1)].clone()
    }
}
