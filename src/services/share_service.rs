//! The operations the HTTP layer and CLI call.
//!
//! Upload writes the object first and only then allocates a code and inserts
//! the record, so a record never points at a partially written object.
//! Download resolves the record, enforces expiry, takes a read lease for
//! ephemeral shares, and hands back a lazy byte stream.

use crate::{
    models::{FileRecord, RecordPage},
    services::{
        assembler::{AssemblerOptions, ObjectAssembler, ObjectStream, WrittenObject},
        chunk_store::ChunkStore,
        error::{ShareError, ShareResult},
        expiry::{
            self, BurnOutcome, DEFAULT_LEASE_TTL, ExpiryPolicy, ExpiryUpdate, ReadLease,
            ShareDuration,
        },
        record_store::{RecordError, RecordStore},
        share_code::{
            CodeGenerator, DEFAULT_CODE_ATTEMPTS, RandomCodeGenerator, ShareCodeIndex,
        },
    },
};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use std::{io, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const PURGE_BATCH: u32 = 100;

#[derive(Clone, Copy, Debug)]
pub struct ShareSettings {
    /// Attempts for code allocation, and separately for claiming a code on insert.
    pub code_attempts: u32,
    /// Lifetime of shares uploaded without an explicit duration.
    pub default_duration: ShareDuration,
    /// How long a read lease survives without renewal.
    pub read_lease_ttl: TimeDelta,
}

impl Default for ShareSettings {
    fn default() -> Self {
        Self {
            code_attempts: DEFAULT_CODE_ATTEMPTS,
            default_duration: ShareDuration::Span {
                count: 1,
                unit: expiry::DurationUnit::Hour,
            },
            read_lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

/// Everything about an upload except its bytes.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub filename: String,
    pub content_type: Option<String>,
    pub is_ephemeral: bool,
    pub is_encrypted: bool,
    pub duration: ShareDuration,
}

impl Default for UploadRequest {
    fn default() -> Self {
        Self {
            filename: "untitled".into(),
            content_type: None,
            is_ephemeral: false,
            is_encrypted: false,
            duration: ShareDuration::Default,
        }
    }
}

/// A resolved download: the record plus its bytes in order.
pub struct Download {
    pub record: FileRecord,
    pub body: ObjectStream,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// Result of a one-shot sweep over expired and consumed shares.
#[derive(Serialize, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub records_removed: u64,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct ShareService {
    records: Arc<dyn RecordStore>,
    assembler: ObjectAssembler,
    expiry: ExpiryPolicy,
    codes: ShareCodeIndex,
    settings: ShareSettings,
}

impl ShareService {
    pub fn new(
        records: Arc<dyn RecordStore>,
        chunk_store: Arc<dyn ChunkStore>,
        options: AssemblerOptions,
        settings: ShareSettings,
    ) -> ShareResult<Self> {
        Self::with_generator(
            records,
            chunk_store,
            options,
            settings,
            Arc::new(RandomCodeGenerator),
        )
    }

    /// Build a service with a custom code source.
    pub fn with_generator(
        records: Arc<dyn RecordStore>,
        chunk_store: Arc<dyn ChunkStore>,
        options: AssemblerOptions,
        settings: ShareSettings,
        generator: Arc<dyn CodeGenerator>,
    ) -> ShareResult<Self> {
        let assembler = ObjectAssembler::new(chunk_store, options)?;
        let expiry = ExpiryPolicy::new(
            records.clone(),
            assembler.clone(),
            settings.read_lease_ttl,
        );
        let codes = ShareCodeIndex::new(
            records.clone(),
            expiry.clone(),
            generator,
            settings.code_attempts,
        );
        Ok(Self {
            records,
            assembler,
            expiry,
            codes,
            settings,
        })
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn chunk_store(&self) -> &Arc<dyn ChunkStore> {
        self.assembler.store()
    }

    pub fn assembler(&self) -> &ObjectAssembler {
        &self.assembler
    }

    /// Write an object under a fresh id without creating a record yet.
    pub async fn store_object<S>(&self, input: S) -> ShareResult<WrittenObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let object_id = Uuid::new_v4().to_string();
        self.assembler.write(&object_id, input).await
    }

    /// Bind a written object to a code and persist its record.
    ///
    /// On failure the object is deleted best-effort; it was never reachable.
    pub async fn publish(
        &self,
        written: WrittenObject,
        request: UploadRequest,
    ) -> ShareResult<FileRecord> {
        let result = self.insert_record(&written, request).await;
        if result.is_err() {
            if let Err(err) = self.assembler.delete(&written.object_id).await {
                warn!(object_id = %written.object_id, "failed to clean up unpublished object: {}", err);
            }
        }
        result
    }

    /// Store `input` and publish it in one step.
    pub async fn upload<S>(&self, request: UploadRequest, input: S) -> ShareResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let written = self.store_object(input).await?;
        self.publish(written, request).await
    }

    async fn insert_record(
        &self,
        written: &WrittenObject,
        request: UploadRequest,
    ) -> ShareResult<FileRecord> {
        let now = expiry::now();
        let id = Uuid::parse_str(&written.object_id).unwrap_or_else(|_| Uuid::new_v4());
        let due_date = request
            .duration
            .due_date_from(now, self.settings.default_duration);
        let content_type = request
            .content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        for _ in 0..self.codes.max_attempts() {
            let code = self.codes.allocate(now).await?;
            let record = FileRecord {
                id,
                code,
                object_id: written.object_id.clone(),
                filename: request.filename.clone(),
                content_type: content_type.clone(),
                size: written.size,
                hash: written.hash.clone(),
                due_date,
                is_ephemeral: request.is_ephemeral,
                is_encrypted: request.is_encrypted,
                created_at: now,
            };
            match self.records.insert(&record).await {
                Ok(()) => {
                    info!(
                        id = %record.id,
                        code = %record.code,
                        size = record.size,
                        ephemeral = record.is_ephemeral,
                        "published share"
                    );
                    return Ok(record);
                }
                Err(RecordError::CodeTaken(code)) => {
                    debug!(%code, "lost race for share code, allocating another");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(ShareError::CapacityExhausted {
            attempts: self.codes.max_attempts(),
        })
    }

    /// Open a share for reading by id.
    pub async fn download(&self, id: Uuid) -> ShareResult<Download> {
        let not_found = || ShareError::NotFound(format!("file `{id}`"));
        let record = self.records.get(id).await?.ok_or_else(not_found)?;

        if self.is_expired(&record, expiry::now()) {
            if let Err(err) = self.expiry.purge(&record).await {
                warn!(%id, "failed to purge expired share: {}", err);
            }
            return Err(not_found());
        }

        let lease = self.expiry.begin_read(&record).await?;
        let body = match self.assembler.read(&record.object_id).await {
            Ok(body) => body,
            Err(err) => {
                if err.is_not_found() {
                    warn!(%id, object_id = %record.object_id, "record points at a missing object");
                }
                if let Some(lease) = lease {
                    if let Err(release_err) = lease.abandon().await {
                        warn!(%id, "failed to release read lease: {}", release_err);
                    }
                }
                return Err(err);
            }
        };

        Ok(Download {
            record,
            body: leased_body(body, lease),
        })
    }

    pub async fn allocate_code(&self) -> ShareResult<String> {
        self.codes.allocate(expiry::now()).await
    }

    pub async fn resolve_code(&self, code: &str) -> ShareResult<FileRecord> {
        self.codes.resolve(code, expiry::now()).await
    }

    pub fn is_expired(&self, record: &FileRecord, now: DateTime<Utc>) -> bool {
        ExpiryPolicy::is_expired(record, now)
    }

    /// Report a completed read of an ephemeral share. Downloads do this on
    /// their own when the body stream ends.
    pub async fn on_read(&self, lease: ReadLease) -> ShareResult<BurnOutcome> {
        lease.complete().await
    }

    pub async fn update_expiry(&self, id: Uuid, update: ExpiryUpdate) -> ShareResult<FileRecord> {
        let record = self
            .records
            .get(id)
            .await?
            .ok_or_else(|| ShareError::NotFound(format!("file `{id}`")))?;
        self.expiry.apply_update(&record, update).await
    }

    pub async fn delete(&self, id: Uuid) -> ShareResult<()> {
        let not_found = || ShareError::NotFound(format!("file `{id}`"));
        let record = self.records.get(id).await?.ok_or_else(not_found)?;
        if !self.expiry.purge(&record).await? {
            return Err(not_found());
        }
        info!(%id, "deleted share");
        Ok(())
    }

    pub async fn list(&self, page: u32, size: u32) -> ShareResult<RecordPage> {
        let items = self.records.list(page, size).await?;
        let total = self.records.count().await?;
        Ok(RecordPage {
            items,
            total,
            page: page.max(1),
            size: size.clamp(1, 100),
        })
    }

    /// Delete every share whose due date has passed, then every consumed
    /// burn-after-read share that no live reader still holds.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> ShareResult<PurgeReport> {
        let mut report = PurgeReport::default();
        loop {
            let batch = self.records.expired(now, PURGE_BATCH).await?;
            if !self.purge_batch(&batch, "expired", &mut report).await {
                break;
            }
        }
        let cutoff = self.expiry.lease_cutoff(now);
        loop {
            let batch = self.records.consumed(cutoff, PURGE_BATCH).await?;
            if !self.purge_batch(&batch, "consumed", &mut report).await {
                break;
            }
        }

        info!(
            removed = report.records_removed,
            bytes = report.bytes_freed,
            errors = report.errors.len(),
            "purged shares"
        );
        Ok(report)
    }

    /// Purge one batch. Returns whether another batch may be waiting.
    async fn purge_batch(
        &self,
        batch: &[FileRecord],
        kind: &str,
        report: &mut PurgeReport,
    ) -> bool {
        let mut progressed = false;
        for record in batch {
            match self.expiry.purge(record).await {
                Ok(true) => {
                    progressed = true;
                    report.records_removed += 1;
                    report.bytes_freed += record.size;
                }
                Ok(false) => progressed = true,
                Err(err) => {
                    warn!(id = %record.id, kind, "failed to purge share: {}", err);
                    report.errors.push(format!("{}: {}", record.id, err));
                }
            }
        }
        progressed && batch.len() == PURGE_BATCH as usize
    }
}

/// Release the read lease once the body ends: a fully drained stream
/// consumes the share, an error or an early drop does not.
fn leased_body(body: ObjectStream, lease: Option<ReadLease>) -> ObjectStream {
    if lease.is_none() {
        return body;
    }

    Box::pin(stream::unfold(Some((body, lease)), |state| async move {
        let (mut body, mut lease) = state?;
        match body.next().await {
            Some(Ok(bytes)) => {
                if let Some(lease) = lease.as_mut() {
                    if let Err(err) = lease.keep_alive().await {
                        warn!("failed to renew read lease: {}", err);
                    }
                }
                Some((Ok(bytes), Some((body, lease))))
            }
            Some(Err(err)) => {
                if let Some(lease) = lease {
                    if let Err(release_err) = lease.abandon().await {
                        warn!("failed to release read lease: {}", release_err);
                    }
                }
                Some((Err(err), None))
            }
            None => {
                if let Some(lease) = lease {
                    match lease.complete().await {
                        Ok(outcome) => debug!(?outcome, "ephemeral read completed"),
                        Err(err) => warn!("failed to complete ephemeral read: {}", err),
                    }
                }
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        chunk_store::MemoryChunkStore,
        expiry::{DueDateUpdate, never},
        record_store::tests::memory_store,
    };
    use chrono::Duration;
    use futures::TryStreamExt;

    async fn service(chunk_size: usize) -> (ShareService, Arc<MemoryChunkStore>) {
        let chunks = Arc::new(MemoryChunkStore::new());
        let service = ShareService::new(
            Arc::new(memory_store().await),
            chunks.clone(),
            AssemblerOptions {
                chunk_size,
                ..AssemblerOptions::default()
            },
            ShareSettings::default(),
        )
        .unwrap();
        (service, chunks)
    }

    fn body(data: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter([Ok(Bytes::from_static(data))])
    }

    async fn drain(download: Download) -> Vec<u8> {
        let parts: Vec<Bytes> = download.body.try_collect().await.unwrap();
        parts.concat()
    }

    #[tokio::test]
    async fn upload_then_download_by_id_and_code() {
        let (service, _) = service(4).await;
        let request = UploadRequest {
            filename: "notes.txt".into(),
            content_type: Some("text/plain".into()),
            ..UploadRequest::default()
        };
        let record = service.upload(request, body(b"hello world")).await.unwrap();

        assert_eq!(record.size, 11);
        assert_eq!(record.object_id, record.id.to_string());
        assert_eq!(record.hash, format!("{:x}", md5::compute(b"hello world")));

        let resolved = service.resolve_code(&record.code.to_lowercase()).await.unwrap();
        assert_eq!(resolved.id, record.id);

        let download = service.download(record.id).await.unwrap();
        assert_eq!(download.record.filename, "notes.txt");
        assert_eq!(drain(download).await, b"hello world");
    }

    #[tokio::test]
    async fn default_duration_is_one_hour() {
        let (service, _) = service(16).await;
        let before = expiry::now();
        let record = service
            .upload(UploadRequest::default(), body(b"x"))
            .await
            .unwrap();
        assert!(record.due_date >= before + Duration::hours(1));
        assert!(record.due_date <= expiry::now() + Duration::hours(1));
        assert_eq!(record.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn ephemeral_share_burns_after_full_read() {
        let (service, chunks) = service(4).await;
        let request = UploadRequest {
            is_ephemeral: true,
            ..UploadRequest::default()
        };
        let record = service.upload(request, body(b"burn me now")).await.unwrap();

        assert_eq!(drain(service.download(record.id).await.unwrap()).await, b"burn me now");

        assert!(service.download(record.id).await.unwrap_err().is_not_found());
        assert!(service.resolve_code(&record.code).await.unwrap_err().is_not_found());
        assert!(chunks.is_empty().await);
    }

    #[tokio::test]
    async fn dropped_download_keeps_ephemeral_share() {
        let (service, _) = service(4).await;
        let request = UploadRequest {
            is_ephemeral: true,
            ..UploadRequest::default()
        };
        let record = service.upload(request, body(b"partial read")).await.unwrap();

        let mut download = service.download(record.id).await.unwrap();
        let first = download.body.next().await.unwrap().unwrap();
        assert_eq!(first.as_ref(), b"part");
        drop(download);
        tokio::task::yield_now().await;

        let again = service.download(record.id).await.unwrap();
        assert_eq!(drain(again).await, b"partial read");
    }

    #[tokio::test]
    async fn expiry_updates_and_purge() {
        let (service, chunks) = service(4).await;
        let record = service
            .upload(UploadRequest::default(), body(b"expiring"))
            .await
            .unwrap();

        let updated = service
            .update_expiry(
                record.id,
                ExpiryUpdate {
                    due_date: DueDateUpdate::Permanent,
                    is_ephemeral: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.due_date, never());

        let past = expiry::now() - Duration::minutes(1);
        service
            .update_expiry(
                record.id,
                ExpiryUpdate {
                    due_date: DueDateUpdate::At(past),
                    is_ephemeral: None,
                },
            )
            .await
            .unwrap();

        let report = service.purge_expired(expiry::now()).await.unwrap();
        assert_eq!(report.records_removed, 1);
        assert_eq!(report.bytes_freed, 8);
        assert!(report.errors.is_empty());
        assert!(chunks.is_empty().await);
        assert!(service.download(record.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_and_list() {
        let (service, chunks) = service(4).await;
        let first = service
            .upload(UploadRequest::default(), body(b"one"))
            .await
            .unwrap();
        service
            .upload(UploadRequest::default(), body(b"two two"))
            .await
            .unwrap();

        let page = service.list(1, 10).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 2);

        service.delete(first.id).await.unwrap();
        assert!(service.delete(first.id).await.unwrap_err().is_not_found());
        assert_eq!(service.list(1, 10).await.unwrap().total, 1);
        assert!(!chunks.keys().await.contains(&first.object_id));
    }

    #[tokio::test]
    async fn oversized_upload_leaves_nothing_behind() {
        let chunks = Arc::new(MemoryChunkStore::new());
        let service = ShareService::new(
            Arc::new(memory_store().await),
            chunks.clone(),
            AssemblerOptions {
                chunk_size: 4,
                max_object_size: Some(5),
                ..AssemblerOptions::default()
            },
            ShareSettings::default(),
        )
        .unwrap();

        let err = service
            .upload(UploadRequest::default(), body(b"way too long"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::TooLarge { limit: 5 }));
        assert_eq!(service.list(1, 10).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn streaming_reader_keeps_its_lease_alive() {
        let chunks = Arc::new(MemoryChunkStore::new());
        let service = ShareService::new(
            Arc::new(memory_store().await),
            chunks.clone(),
            AssemblerOptions {
                chunk_size: 4,
                ..AssemblerOptions::default()
            },
            ShareSettings {
                read_lease_ttl: TimeDelta::milliseconds(200),
                ..ShareSettings::default()
            },
        )
        .unwrap();
        let request = UploadRequest {
            is_ephemeral: true,
            ..UploadRequest::default()
        };
        let record = service.upload(request, body(b"slow reader!")).await.unwrap();

        let mut slow = service.download(record.id).await.unwrap();
        assert_eq!(slow.body.next().await.unwrap().unwrap(), "slow");
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        // Pulling the next chunk renews the lease that would otherwise lapse.
        assert_eq!(slow.body.next().await.unwrap().unwrap(), " rea");

        let fast = service.download(record.id).await.unwrap();
        assert_eq!(drain(fast).await, b"slow reader!");
        assert!(chunks.keys().await.contains(&record.object_id));

        let rest: Vec<Bytes> = slow.body.try_collect().await.unwrap();
        assert_eq!(rest.concat(), b"der!");
        assert!(service.records().get(record.id).await.unwrap().is_none());
        assert!(chunks.is_empty().await);
    }
}
