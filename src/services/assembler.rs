//! ObjectAssembler: splits uploads into chunk blobs, publishes a manifest on
//! the root key, and streams objects back in manifest order.
//!
//! Objects shorter than one chunk are stored inline under the root key with
//! no manifest. Anything larger is written as independent chunk keys; the
//! manifest is committed on the root key only once every chunk write has been
//! acknowledged, so a reader either sees the whole object or nothing.

use crate::{
    models::{ChunkRef, Manifest, StoredObject},
    services::{
        chunk_store::{ChunkStore, StoreResult},
        error::{ShareError, ShareResult},
        planner::{ChunkSplitter, chunk_ranges, is_inline, plan_chunks},
        retry::RetryPolicy,
    },
};
use bytes::Bytes;
use futures::{Stream, StreamExt, future, pin_mut, stream};
use std::{io, pin::Pin, sync::Arc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// A boxed, single-pass stream of object bytes.
pub type ObjectStream = Pin<Box<dyn Stream<Item = ShareResult<Bytes>> + Send>>;

/// 25 MiB, the per-value ceiling of the key-value store the service targets.
pub const DEFAULT_CHUNK_SIZE: usize = 25 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct AssemblerOptions {
    /// Maximum bytes per stored value.
    pub chunk_size: usize,
    /// Chunk writes allowed in flight at once.
    pub write_concurrency: usize,
    /// Chunk reads allowed in flight ahead of the consumer. 1 means no prefetch.
    pub prefetch_depth: usize,
    /// Largest accepted object, if any.
    pub max_object_size: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_concurrency: 4,
            prefetch_depth: 1,
            max_object_size: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a successful write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenObject {
    pub object_id: String,
    pub size: u64,
    /// MD5 of the stored bytes, lowercase hex.
    pub hash: String,
    /// Number of chunk blobs; 0 for inline objects.
    pub chunk_count: usize,
}

/// Key of chunk `chunk_id` belonging to `object_id`.
pub fn chunk_key(object_id: &str, chunk_id: u32) -> String {
    format!("{object_id}/{chunk_id:06}")
}

#[derive(Clone)]
pub struct ObjectAssembler {
    store: Arc<dyn ChunkStore>,
    options: AssemblerOptions,
}

impl ObjectAssembler {
    pub fn new(store: Arc<dyn ChunkStore>, options: AssemblerOptions) -> ShareResult<Self> {
        // Fails early on a zero chunk size.
        ChunkSplitter::new(options.chunk_size)?;
        if options.write_concurrency == 0 || options.prefetch_depth == 0 {
            return Err(ShareError::BadRequest(
                "write concurrency and prefetch depth must be at least 1".into(),
            ));
        }
        Ok(Self { store, options })
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn options(&self) -> &AssemblerOptions {
        &self.options
    }

    /// Write a fully buffered payload, pre-sliced on chunk boundaries.
    pub async fn write_bytes(&self, object_id: &str, data: Bytes) -> ShareResult<WrittenObject> {
        let pieces = chunk_ranges(data.len() as u64, self.options.chunk_size as u64)?
            .into_iter()
            .map(|range| Ok::<_, io::Error>(data.slice(range.start as usize..range.end as usize)))
            .collect::<Vec<_>>();
        self.write(object_id, stream::iter(pieces)).await
    }

    /// Stream an upload into the store under `object_id`.
    ///
    /// Chunk boundaries are cut whenever the buffered input reaches the chunk
    /// size. On any failure the root key is left unwritten; chunk blobs that
    /// did land are unreferenced garbage.
    #[instrument(skip(self, input), fields(backend = self.store.backend_name()))]
    pub async fn write<S>(&self, object_id: &str, input: S) -> ShareResult<WrittenObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut splitter = ChunkSplitter::new(self.options.chunk_size)?;
        let mut writes = ChunkWrites::new(
            self.store.clone(),
            self.options.retry,
            self.options.write_concurrency,
            object_id,
        );
        let mut digest = md5::Context::new();
        let mut size: u64 = 0;
        let mut chunks: Vec<ChunkRef> = Vec::new();

        pin_mut!(input);
        while let Some(item) = input.next().await {
            let data = item.map_err(|err| ShareError::write_failure(object_id, err))?;
            size += data.len() as u64;
            if let Some(limit) = self.options.max_object_size {
                if size > limit {
                    return Err(ShareError::TooLarge { limit });
                }
            }
            digest.consume(&data);

            for chunk in splitter.push(&data) {
                chunks.push(writes.spawn(chunks.len() as u32, chunk).await?);
            }
        }

        let hash = format!("{:x}", digest.compute());
        let remainder = splitter.finish();

        if is_inline(size, self.options.chunk_size as u64) {
            self.options
                .retry
                .run("put inline object", || {
                    self.store.put(object_id, remainder.clone(), None)
                })
                .await
                .map_err(|err| ShareError::write_failure(object_id, err))?;
            debug!(object_id, size, "stored inline object");
            return Ok(WrittenObject {
                object_id: object_id.to_string(),
                size,
                hash,
                chunk_count: 0,
            });
        }

        if !remainder.is_empty() {
            chunks.push(writes.spawn(chunks.len() as u32, remainder).await?);
        }
        writes.join_all().await?;

        let lengths: Vec<u64> = chunks.iter().map(|chunk| chunk.size).collect();
        if lengths != plan_chunks(size, self.options.chunk_size as u64)? {
            return Err(ShareError::write_failure(
                object_id,
                "chunk lengths disagree with the planned split",
            ));
        }

        let manifest = Manifest::new(chunks);
        let chunk_count = manifest.len();
        self.options
            .retry
            .run("commit manifest", || {
                self.store.put(object_id, Bytes::new(), Some(manifest.clone()))
            })
            .await
            .map_err(|err| ShareError::write_failure(object_id, err))?;

        info!(object_id, size, chunk_count, "committed chunked object");
        Ok(WrittenObject {
            object_id: object_id.to_string(),
            size,
            hash,
            chunk_count,
        })
    }

    /// Fetch the root key and decide which shape the object has.
    pub async fn open(&self, object_id: &str) -> ShareResult<StoredObject> {
        let stored = self
            .options
            .retry
            .run("get root", || self.store.get_with_metadata(object_id))
            .await?;

        match stored {
            None => Err(ShareError::NotFound(format!("object `{object_id}`"))),
            Some(root) => match root.metadata {
                Some(manifest) => {
                    manifest
                        .validate()
                        .map_err(|reason| ShareError::integrity(object_id, reason))?;
                    Ok(StoredObject::Chunked(manifest))
                }
                None => Ok(StoredObject::Inline(root.value)),
            },
        }
    }

    /// Open `object_id` and return its bytes as a lazy, ordered stream.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn read(&self, object_id: &str) -> ShareResult<ObjectStream> {
        let object = self.open(object_id).await?;
        Ok(self.stream_object(object_id, object))
    }

    /// Turn an opened object into a byte stream.
    ///
    /// Chunks are fetched with up to `prefetch_depth` requests in flight but
    /// always yielded in manifest order. The stream ends after the first error.
    pub fn stream_object(&self, object_id: &str, object: StoredObject) -> ObjectStream {
        match object {
            StoredObject::Inline(bytes) => Box::pin(stream::once(future::ready(Ok(bytes)))),
            StoredObject::Chunked(manifest) => {
                let store = self.store.clone();
                let retry = self.options.retry;
                let root = object_id.to_string();

                let chunks = stream::iter(manifest.into_chunks())
                    .map(move |chunk| fetch_chunk(store.clone(), retry, root.clone(), chunk))
                    .buffered(self.options.prefetch_depth)
                    .scan(false, |failed, item| {
                        if *failed {
                            return future::ready(None);
                        }
                        *failed = item.is_err();
                        future::ready(Some(item))
                    });
                Box::pin(chunks)
            }
        }
    }

    /// Remove an object's root key and then its chunks. Missing objects are a no-op.
    ///
    /// Once the root is gone the object no longer resolves, so chunks that
    /// fail to delete afterwards are unreachable and only logged.
    pub async fn delete(&self, object_id: &str) -> ShareResult<()> {
        let stored = self
            .options
            .retry
            .run("get root", || self.store.get_with_metadata(object_id))
            .await?;
        let Some(root) = stored else {
            return Ok(());
        };

        self.options
            .retry
            .run("delete root", || self.store.delete(object_id))
            .await?;

        if let Some(manifest) = root.metadata {
            for chunk in manifest.chunks() {
                if let Err(err) = self
                    .options
                    .retry
                    .run("delete chunk", || self.store.delete(&chunk.object_id))
                    .await
                {
                    warn!(object_id, chunk = %chunk.object_id, "orphaned chunk left behind: {}", err);
                }
            }
        }
        debug!(object_id, "deleted object");
        Ok(())
    }
}

async fn fetch_chunk(
    store: Arc<dyn ChunkStore>,
    retry: RetryPolicy,
    root: String,
    chunk: ChunkRef,
) -> ShareResult<Bytes> {
    let fetched = retry
        .run("get chunk", || store.get(&chunk.object_id))
        .await
        .map_err(|err| {
            error!(object_id = %root, chunk = chunk.chunk_id, "chunk fetch failed: {}", err);
            ShareError::integrity(&root, format!("chunk {} unreadable: {}", chunk.chunk_id, err))
        })?;

    // A chunk vanishing after its root is a delete racing this read.
    if fetched.is_none() && !root_exists(&store, retry, &root).await {
        debug!(object_id = %root, chunk = chunk.chunk_id, "object deleted during read");
        return Err(ShareError::NotFound(format!("object `{root}`")));
    }

    match fetched {
        None => {
            error!(object_id = %root, chunk = chunk.chunk_id, "manifest references a missing chunk");
            Err(ShareError::integrity(
                &root,
                format!("chunk {} is missing", chunk.chunk_id),
            ))
        }
        Some(bytes) if bytes.len() as u64 != chunk.size => {
            error!(
                object_id = %root,
                chunk = chunk.chunk_id,
                expected = chunk.size,
                actual = bytes.len(),
                "chunk length does not match manifest"
            );
            Err(ShareError::integrity(
                &root,
                format!(
                    "chunk {} has {} bytes, manifest says {}",
                    chunk.chunk_id,
                    bytes.len(),
                    chunk.size
                ),
            ))
        }
        Some(bytes) => Ok(bytes),
    }
}

/// Whether the root key still resolves. A fetch error counts as present so
/// the caller keeps reporting the integrity fault.
async fn root_exists(store: &Arc<dyn ChunkStore>, retry: RetryPolicy, root: &str) -> bool {
    !matches!(retry.run("get root", || store.get(root)).await, Ok(None))
}

/// Group of in-flight chunk writes joined before the manifest commit.
///
/// Dropping the group aborts every write still running.
struct ChunkWrites {
    tasks: JoinSet<StoreResult<()>>,
    store: Arc<dyn ChunkStore>,
    retry: RetryPolicy,
    limit: usize,
    object_id: String,
}

impl ChunkWrites {
    fn new(store: Arc<dyn ChunkStore>, retry: RetryPolicy, limit: usize, object_id: &str) -> Self {
        Self {
            tasks: JoinSet::new(),
            store,
            retry,
            limit: limit.max(1),
            object_id: object_id.to_string(),
        }
    }

    /// Start writing chunk `chunk_id`, waiting for a slot if the group is full.
    async fn spawn(&mut self, chunk_id: u32, data: Bytes) -> ShareResult<ChunkRef> {
        while self.tasks.len() >= self.limit {
            self.join_next().await?;
        }

        let chunk = ChunkRef {
            object_id: chunk_key(&self.object_id, chunk_id),
            chunk_id,
            size: data.len() as u64,
        };
        let store = self.store.clone();
        let retry = self.retry;
        let key = chunk.object_id.clone();
        self.tasks.spawn(async move {
            retry
                .run("put chunk", || store.put(&key, data.clone(), None))
                .await
        });
        debug!(object_id = %self.object_id, chunk_id, size = chunk.size, "chunk write started");
        Ok(chunk)
    }

    async fn join_next(&mut self) -> ShareResult<()> {
        match self.tasks.join_next().await {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(err))) => Err(ShareError::write_failure(&self.object_id, err)),
            Some(Err(err)) => Err(ShareError::write_failure(&self.object_id, err)),
        }
    }

    async fn join_all(&mut self) -> ShareResult<()> {
        while !self.tasks.is_empty() {
            self.join_next().await?;
        }
        Ok(())
    }
}
