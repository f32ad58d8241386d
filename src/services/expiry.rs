//! Due dates, the "never" sentinel, and burn-after-read.
//!
//! Burn-after-read is built on read leases held in the record store. Every
//! reader of an ephemeral record takes a lease before fetching bytes. A
//! reader that delivers the whole object marks the record consumed when it
//! releases, and whichever release leaves no lease behind on a consumed record
//! deletes it. Only one release can observe that transition, and it cannot
//! happen while another reader is still streaming.
//!
//! Leases are renewed while bytes flow and lapse after `lease_ttl` without a
//! renewal, so a reader that dies without releasing cannot pin a consumed
//! record forever.

use crate::{
    models::FileRecord,
    services::{
        assembler::ObjectAssembler,
        error::{ShareError, ShareResult},
        record_store::RecordStore,
    },
};
use chrono::{DateTime, Months, SubsecRound, TimeDelta, Utc};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Default time a read lease survives without renewal.
pub const DEFAULT_LEASE_TTL: TimeDelta = TimeDelta::minutes(15);

/// 9999-12-31T23:59:59Z in seconds.
const NEVER_TIMESTAMP: i64 = 253_402_300_799;

/// Due date stored for permanent shares.
pub fn never() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(NEVER_TIMESTAMP, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn is_never(due_date: DateTime<Utc>) -> bool {
    due_date >= never()
}

/// True iff a concrete due date lies before `now`.
pub fn is_expired(due_date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    !is_never(due_date) && due_date < now
}

/// Current time at the millisecond precision records are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// How an update treats the due date.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DueDateUpdate {
    /// Field absent: leave the due date alone.
    #[default]
    Unchanged,
    /// Explicit null: the share never expires.
    Permanent,
    /// Concrete timestamp.
    At(DateTime<Utc>),
}

impl DueDateUpdate {
    /// Map the wire shape (`absent | null | millis`) onto the tri-state.
    pub fn from_millis(raw: Option<Option<i64>>) -> ShareResult<Self> {
        match raw {
            None => Ok(Self::Unchanged),
            Some(None) => Ok(Self::Permanent),
            Some(Some(millis)) => DateTime::<Utc>::from_timestamp_millis(millis)
                .map(Self::At)
                .ok_or_else(|| ShareError::BadRequest(format!("due date out of range: {millis}"))),
        }
    }
}

/// Administrative change to a record's expiry fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpiryUpdate {
    pub due_date: DueDateUpdate,
    pub is_ephemeral: Option<bool>,
}

impl ExpiryUpdate {
    /// Resulting `(due_date, is_ephemeral)` for `record`.
    pub fn apply(&self, record: &FileRecord) -> (DateTime<Utc>, bool) {
        let due_date = match self.due_date {
            DueDateUpdate::Unchanged => record.due_date,
            DueDateUpdate::Permanent => never(),
            DueDateUpdate::At(at) => at,
        };
        (due_date, self.is_ephemeral.unwrap_or(record.is_ephemeral))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DurationUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Lifetime requested at upload, written as `<count><unit>` (e.g. `3day`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareDuration {
    Default,
    Permanent,
    Span { count: u32, unit: DurationUnit },
}

impl ShareDuration {
    /// Parse a duration string. Anything unrecognized is `Default`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.as_str() {
            "" | "default" => return Self::Default,
            "999year" | "permanent" | "never" => return Self::Permanent,
            _ => {}
        }

        let split = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (digits, unit) = raw.split_at(split);
        let Ok(count) = digits.parse::<u32>() else {
            return Self::Default;
        };
        let unit = match unit {
            "minute" => DurationUnit::Minute,
            "hour" => DurationUnit::Hour,
            "day" => DurationUnit::Day,
            "week" => DurationUnit::Week,
            "month" => DurationUnit::Month,
            "year" => DurationUnit::Year,
            _ => return Self::Default,
        };
        if count == 0 {
            return Self::Default;
        }
        Self::Span { count, unit }
    }

    /// Concrete due date for a share created at `now`.
    ///
    /// `Default` resolves through `fallback`, and to one hour if the fallback
    /// is itself `Default`. Results past the sentinel become the sentinel.
    pub fn due_date_from(&self, now: DateTime<Utc>, fallback: ShareDuration) -> DateTime<Utc> {
        let resolved = match (*self, fallback) {
            (Self::Default, Self::Default) => Self::Span {
                count: 1,
                unit: DurationUnit::Hour,
            },
            (Self::Default, fallback) => fallback,
            (own, _) => own,
        };

        let due = match resolved {
            Self::Permanent | Self::Default => None,
            Self::Span { count, unit } => {
                let count = i64::from(count);
                match unit {
                    DurationUnit::Minute => TimeDelta::try_minutes(count)
                        .and_then(|d| now.checked_add_signed(d)),
                    DurationUnit::Hour => {
                        TimeDelta::try_hours(count).and_then(|d| now.checked_add_signed(d))
                    }
                    DurationUnit::Day => {
                        TimeDelta::try_days(count).and_then(|d| now.checked_add_signed(d))
                    }
                    DurationUnit::Week => {
                        TimeDelta::try_weeks(count).and_then(|d| now.checked_add_signed(d))
                    }
                    DurationUnit::Month => u32::try_from(count)
                        .ok()
                        .and_then(|m| now.checked_add_months(Months::new(m))),
                    DurationUnit::Year => u32::try_from(count)
                        .ok()
                        .and_then(|y| y.checked_mul(12))
                        .and_then(|m| now.checked_add_months(Months::new(m))),
                }
            }
        };

        due.map(|d| d.min(never())).unwrap_or_else(never)
    }
}

/// What happened when a read lease was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurnOutcome {
    /// This release deleted the record and its object.
    Burned,
    /// Consumed, but other readers still hold leases; the last one deletes.
    Deferred,
    /// Not consumed; the record stays readable.
    Retained,
    /// The record was already gone.
    Gone,
}

/// Expiry and burn-after-read decisions over the record and chunk stores.
#[derive(Clone)]
pub struct ExpiryPolicy {
    records: Arc<dyn RecordStore>,
    assembler: ObjectAssembler,
    lease_ttl: TimeDelta,
}

impl ExpiryPolicy {
    pub fn new(
        records: Arc<dyn RecordStore>,
        assembler: ObjectAssembler,
        lease_ttl: TimeDelta,
    ) -> Self {
        Self {
            records,
            assembler,
            lease_ttl,
        }
    }

    /// Leases last stamped before this instant belong to dead readers.
    pub fn lease_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.lease_ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_expired(record: &FileRecord, now: DateTime<Utc>) -> bool {
        is_expired(record.due_date, now)
    }

    /// Take a read lease for an ephemeral record. Non-ephemeral records need
    /// none and get `Ok(None)`. A consumed record reads as not found.
    pub async fn begin_read(&self, record: &FileRecord) -> ShareResult<Option<ReadLease>> {
        if !record.is_ephemeral {
            return Ok(None);
        }
        let taken_at = now();
        if !self
            .records
            .begin_read(record.id, taken_at, self.lease_cutoff(taken_at))
            .await?
        {
            return Err(ShareError::NotFound(format!("file `{}`", record.id)));
        }
        debug!(id = %record.id, "read lease taken");
        Ok(Some(ReadLease {
            inner: Some(LeaseInner {
                policy: self.clone(),
                record: record.clone(),
                renewed_at: taken_at,
            }),
        }))
    }

    /// Persist an expiry update and return the updated record.
    pub async fn apply_update(
        &self,
        record: &FileRecord,
        update: ExpiryUpdate,
    ) -> ShareResult<FileRecord> {
        let (due_date, is_ephemeral) = update.apply(record);
        if !self
            .records
            .update_expiry(record.id, due_date, is_ephemeral)
            .await?
        {
            return Err(ShareError::NotFound(format!("file `{}`", record.id)));
        }
        Ok(FileRecord {
            due_date,
            is_ephemeral,
            ..record.clone()
        })
    }

    /// Delete an object and then its record. A failed object delete leaves
    /// the record in place for the next sweep. Returns false when another
    /// caller already removed the record.
    pub async fn purge(&self, record: &FileRecord) -> ShareResult<bool> {
        self.assembler.delete(&record.object_id).await?;
        Ok(self.records.delete(record.id).await?)
    }

    async fn release(&self, record: &FileRecord, completed: bool) -> ShareResult<BurnOutcome> {
        let released_at = now();
        let Some(state) = self
            .records
            .finish_read(
                record.id,
                completed,
                released_at,
                self.lease_cutoff(released_at),
            )
            .await?
        else {
            return Ok(BurnOutcome::Gone);
        };

        if !state.consumed {
            return Ok(BurnOutcome::Retained);
        }
        if state.active_reads > 0 {
            debug!(id = %record.id, remaining = state.active_reads, "burn deferred to last reader");
            return Ok(BurnOutcome::Deferred);
        }
        if self.purge(record).await? {
            info!(id = %record.id, code = %record.code, "burned after read");
            Ok(BurnOutcome::Burned)
        } else {
            Ok(BurnOutcome::Gone)
        }
    }
}

struct LeaseInner {
    policy: ExpiryPolicy,
    record: FileRecord,
    renewed_at: DateTime<Utc>,
}

/// A held read lease on an ephemeral record.
///
/// Dropping an unreleased lease releases it in the background without
/// consuming the record.
pub struct ReadLease {
    inner: Option<LeaseInner>,
}

impl ReadLease {
    /// Refresh the lease once a quarter of its ttl has passed since the last
    /// refresh. Cheap to call per chunk.
    pub async fn keep_alive(&mut self) -> ShareResult<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(());
        };
        let at = now();
        if at - inner.renewed_at < inner.policy.lease_ttl / 4 {
            return Ok(());
        }
        inner.policy.records.renew_read(inner.record.id, at).await?;
        inner.renewed_at = at;
        Ok(())
    }

    /// The whole object was delivered: consume, and burn if last out.
    pub async fn complete(mut self) -> ShareResult<BurnOutcome> {
        match self.inner.take() {
            Some(inner) => inner.policy.release(&inner.record, true).await,
            None => Ok(BurnOutcome::Gone),
        }
    }

    /// The read stopped early: give the lease back without consuming.
    pub async fn abandon(mut self) -> ShareResult<BurnOutcome> {
        match self.inner.take() {
            Some(inner) => inner.policy.release(&inner.record, false).await,
            None => Ok(BurnOutcome::Gone),
        }
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = inner.policy.release(&inner.record, false).await {
                        warn!(id = %inner.record.id, "failed to release read lease: {}", err);
                    }
                });
            }
            Err(_) => warn!(
                id = %inner.record.id,
                "read lease dropped outside a runtime; it lapses after the lease ttl"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn expiry_is_strictly_before_now() {
        let now = at(2025, 6, 1);
        assert!(is_expired(now - Duration::seconds(1), now));
        assert!(!is_expired(now, now));
        assert!(!is_expired(now + Duration::seconds(1), now));
        assert!(!is_expired(never(), now));
        assert!(!is_expired(never(), DateTime::<Utc>::MAX_UTC));
    }

    #[test]
    fn sentinel_is_year_9999() {
        assert_eq!(never(), Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap());
        assert!(is_never(never()));
    }

    #[test]
    fn tri_state_due_date_updates() {
        assert_eq!(DueDateUpdate::from_millis(None).unwrap(), DueDateUpdate::Unchanged);
        assert_eq!(
            DueDateUpdate::from_millis(Some(None)).unwrap(),
            DueDateUpdate::Permanent
        );
        let millis = at(2030, 1, 1).timestamp_millis();
        assert_eq!(
            DueDateUpdate::from_millis(Some(Some(millis))).unwrap(),
            DueDateUpdate::At(at(2030, 1, 1))
        );
        assert!(DueDateUpdate::from_millis(Some(Some(i64::MAX))).is_err());
    }

    #[test]
    fn apply_translates_permanent_into_sentinel() {
        let record = FileRecord {
            id: Uuid::nil(),
            code: "ABC234".into(),
            object_id: "o".into(),
            filename: "f".into(),
            content_type: "text/plain".into(),
            size: 0,
            hash: String::new(),
            due_date: at(2025, 1, 1),
            is_ephemeral: true,
            is_encrypted: false,
            created_at: at(2024, 1, 1),
        };

        let unchanged = ExpiryUpdate::default().apply(&record);
        assert_eq!(unchanged, (at(2025, 1, 1), true));

        let permanent = ExpiryUpdate {
            due_date: DueDateUpdate::Permanent,
            is_ephemeral: Some(false),
        }
        .apply(&record);
        assert_eq!(permanent, (never(), false));

        let concrete = ExpiryUpdate {
            due_date: DueDateUpdate::At(at(2026, 2, 2)),
            is_ephemeral: None,
        }
        .apply(&record);
        assert_eq!(concrete, (at(2026, 2, 2), true));
    }

    #[test]
    fn parses_duration_strings() {
        assert_eq!(ShareDuration::parse(""), ShareDuration::Default);
        assert_eq!(ShareDuration::parse("default"), ShareDuration::Default);
        assert_eq!(ShareDuration::parse("999year"), ShareDuration::Permanent);
        assert_eq!(
            ShareDuration::parse("3day"),
            ShareDuration::Span {
                count: 3,
                unit: DurationUnit::Day
            }
        );
        assert_eq!(ShareDuration::parse("0hour"), ShareDuration::Default);
        assert_eq!(ShareDuration::parse("5fortnight"), ShareDuration::Default);
        assert_eq!(ShareDuration::parse("hour"), ShareDuration::Default);
    }

    #[test]
    fn computes_due_dates() {
        let now = at(2025, 1, 31);
        let default = ShareDuration::Default;
        assert_eq!(
            ShareDuration::Default.due_date_from(now, default),
            now + Duration::hours(1)
        );
        assert_eq!(
            ShareDuration::parse("2week").due_date_from(now, default),
            now + Duration::weeks(2)
        );
        assert_eq!(
            ShareDuration::parse("1month").due_date_from(now, default),
            at(2025, 2, 28)
        );
        assert_eq!(
            ShareDuration::parse("1year").due_date_from(now, default),
            at(2026, 1, 31)
        );
        assert_eq!(
            ShareDuration::Permanent.due_date_from(now, default),
            never()
        );
        assert_eq!(
            ShareDuration::parse("9000year").due_date_from(now, default),
            never()
        );
        let fallback = ShareDuration::parse("1day");
        assert_eq!(
            ShareDuration::Default.due_date_from(now, fallback),
            now + Duration::days(1)
        );
    }
}
