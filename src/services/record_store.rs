//! FileRecord persistence.
//!
//! The record store owns the relational side of a share: metadata rows, the
//! code index, and the read lease counters that make burn-after-read a
//! single-winner operation. Every state change that must happen exactly once
//! is a conditional `UPDATE`, so the guarantee holds across server instances
//! sharing one database.
//!
//! Leases carry a shared `lease_touched_at` stamp. Readers renew it while
//! streaming; once it falls behind the caller's `stale_before` cutoff the
//! outstanding count belongs to readers that died without releasing and is
//! treated as zero.

use crate::models::FileRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str = "id, code, object_id, filename, content_type, size, hash, \
                              due_date, is_ephemeral, is_encrypted, created_at";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("share code `{0}` is already taken")]
    CodeTaken(String),
    #[error("corrupt record row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RecordResult<T> = Result<T, RecordError>;

/// State of a record right after a reader released its lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRelease {
    /// Leases still held by other readers.
    pub active_reads: i64,
    /// Whether some reader has completed a full read.
    pub consumed: bool,
}

#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Insert a new record. Fails with `CodeTaken` when the code is held.
    async fn insert(&self, record: &FileRecord) -> RecordResult<()>;

    async fn get(&self, id: Uuid) -> RecordResult<Option<FileRecord>>;

    /// Look up an unconsumed record by share code.
    async fn find_by_code(&self, code: &str) -> RecordResult<Option<FileRecord>>;

    /// Overwrite expiry fields. Returns false when the record is gone.
    async fn update_expiry(
        &self,
        id: Uuid,
        due_date: DateTime<Utc>,
        is_ephemeral: bool,
    ) -> RecordResult<bool>;

    /// Remove a record. Returns true only for the call that removed it.
    async fn delete(&self, id: Uuid) -> RecordResult<bool>;

    /// Unconsumed records, newest first. `page` starts at 1.
    async fn list(&self, page: u32, size: u32) -> RecordResult<Vec<FileRecord>>;

    async fn count(&self) -> RecordResult<u64>;

    /// Records whose due date is before `now`, oldest first.
    async fn expired(&self, now: DateTime<Utc>, limit: u32) -> RecordResult<Vec<FileRecord>>;

    /// Consumed records that no live reader holds, oldest first.
    async fn consumed(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> RecordResult<Vec<FileRecord>>;

    /// Take a read lease. Fails (returns false) once the record is consumed.
    async fn begin_read(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> RecordResult<bool>;

    /// Refresh the lease stamp while a read is in progress.
    async fn renew_read(&self, id: Uuid, now: DateTime<Utc>) -> RecordResult<bool>;

    /// Release a lease, marking the record consumed when `completed`.
    async fn finish_read(
        &self,
        id: Uuid,
        completed: bool,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> RecordResult<Option<ReadRelease>>;

    async fn health_check(&self) -> RecordResult<()>;
}

/// Row as stored: timestamps are Unix milliseconds.
#[derive(FromRow)]
struct FileRow {
    id: Uuid,
    code: String,
    object_id: String,
    filename: String,
    content_type: String,
    size: i64,
    hash: String,
    due_date: i64,
    is_ephemeral: bool,
    is_encrypted: bool,
    created_at: i64,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = RecordError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        let millis = |value: i64, field: &str| {
            DateTime::<Utc>::from_timestamp_millis(value)
                .ok_or_else(|| RecordError::Corrupt(format!("{field} out of range: {value}")))
        };
        Ok(FileRecord {
            due_date: millis(row.due_date, "due_date")?,
            created_at: millis(row.created_at, "created_at")?,
            size: u64::try_from(row.size)
                .map_err(|_| RecordError::Corrupt(format!("negative size: {}", row.size)))?,
            id: row.id,
            code: row.code,
            object_id: row.object_id,
            filename: row.filename,
            content_type: row.content_type,
            hash: row.hash,
            is_ephemeral: row.is_ephemeral,
            is_encrypted: row.is_encrypted,
        })
    }
}

/// SQLite-backed record store.
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Arc<SqlitePool>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema, one statement at a time.
    pub async fn migrate(&self) -> RecordResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements...", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    fn collect_rows(rows: Vec<FileRow>) -> RecordResult<Vec<FileRecord>> {
        rows.into_iter().map(FileRecord::try_from).collect()
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert(&self, record: &FileRecord) -> RecordResult<()> {
        let result = sqlx::query(
            "INSERT INTO files (id, code, object_id, filename, content_type, size, hash,
                                due_date, is_ephemeral, is_encrypted, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.code)
        .bind(&record.object_id)
        .bind(&record.filename)
        .bind(&record.content_type)
        .bind(record.size as i64)
        .bind(&record.hash)
        .bind(record.due_date.timestamp_millis())
        .bind(record.is_ephemeral)
        .bind(record.is_encrypted)
        .bind(record.created_at.timestamp_millis())
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RecordError::CodeTaken(record.code.clone())),
            Err(err) => Err(RecordError::Sqlx(err)),
        }
    }

    async fn get(&self, id: Uuid) -> RecordResult<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM files WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        row.map(FileRecord::try_from).transpose()
    }

    async fn find_by_code(&self, code: &str) -> RecordResult<Option<FileRecord>> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM files WHERE code = ? AND consumed_at IS NULL"
        ))
        .bind(code)
        .fetch_optional(&*self.db)
        .await?;
        row.map(FileRecord::try_from).transpose()
    }

    async fn update_expiry(
        &self,
        id: Uuid,
        due_date: DateTime<Utc>,
        is_ephemeral: bool,
    ) -> RecordResult<bool> {
        let result = sqlx::query("UPDATE files SET due_date = ?, is_ephemeral = ? WHERE id = ?")
            .bind(due_date.timestamp_millis())
            .bind(is_ephemeral)
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: Uuid) -> RecordResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, page: u32, size: u32) -> RecordResult<Vec<FileRecord>> {
        let size = size.clamp(1, 100);
        let offset = i64::from(page.max(1) - 1) * i64::from(size);
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM files WHERE consumed_at IS NULL
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        ))
        .bind(i64::from(size))
        .bind(offset)
        .fetch_all(&*self.db)
        .await?;
        Self::collect_rows(rows)
    }

    async fn count(&self) -> RecordResult<u64> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE consumed_at IS NULL")
                .fetch_one(&*self.db)
                .await?;
        Ok(total.max(0) as u64)
    }

    async fn expired(&self, now: DateTime<Utc>, limit: u32) -> RecordResult<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM files WHERE due_date < ?
             ORDER BY due_date ASC LIMIT ?"
        ))
        .bind(now.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&*self.db)
        .await?;
        Self::collect_rows(rows)
    }

    async fn consumed(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> RecordResult<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM files
             WHERE consumed_at IS NOT NULL
               AND (active_reads = 0 OR lease_touched_at IS NULL OR lease_touched_at < ?)
             ORDER BY consumed_at ASC LIMIT ?"
        ))
        .bind(stale_before.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&*self.db)
        .await?;
        Self::collect_rows(rows)
    }

    async fn begin_read(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> RecordResult<bool> {
        let result = sqlx::query(
            "UPDATE files
             SET active_reads = CASE WHEN lease_touched_at >= ? THEN active_reads + 1 ELSE 1 END,
                 lease_touched_at = ?
             WHERE id = ? AND consumed_at IS NULL",
        )
        .bind(stale_before.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew_read(&self, id: Uuid, now: DateTime<Utc>) -> RecordResult<bool> {
        let result = sqlx::query(
            "UPDATE files SET lease_touched_at = MAX(COALESCE(lease_touched_at, 0), ?)
             WHERE id = ? AND active_reads > 0",
        )
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_read(
        &self,
        id: Uuid,
        completed: bool,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> RecordResult<Option<ReadRelease>> {
        let row: Option<(i64, Option<i64>)> = sqlx::query_as(
            "UPDATE files
             SET active_reads = CASE WHEN lease_touched_at >= ?
                                     THEN MAX(active_reads - 1, 0) ELSE 0 END,
                 consumed_at = CASE WHEN ? THEN COALESCE(consumed_at, ?) ELSE consumed_at END
             WHERE id = ?
             RETURNING active_reads, consumed_at",
        )
        .bind(stale_before.timestamp_millis())
        .bind(completed)
        .bind(now.timestamp_millis())
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(|(active_reads, consumed_at)| ReadRelease {
            active_reads,
            consumed: consumed_at.is_some(),
        }))
    }

    async fn health_check(&self) -> RecordResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(RecordError::Corrupt(format!("unexpected probe result: {one}")));
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
