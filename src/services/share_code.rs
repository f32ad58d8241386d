//! Short share codes that resolve to file records.

use crate::{
    models::FileRecord,
    services::{
        error::{ShareError, ShareResult},
        expiry::ExpiryPolicy,
        record_store::RecordStore,
    },
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const CODE_LENGTH: usize = 6;

/// Uppercase letters and digits minus the easily confused `I L O 0 1`.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub const DEFAULT_CODE_ATTEMPTS: u32 = 16;

/// Source of candidate share codes.
pub trait CodeGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

/// Draws `CODE_LENGTH` characters uniformly from `CODE_ALPHABET`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::rng();
        (0..CODE_LENGTH)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    }
}

/// Uppercase `raw` and check it is a well-formed code.
pub fn normalize_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != CODE_LENGTH || !code.bytes().all(|b| CODE_ALPHABET.contains(&b)) {
        return None;
    }
    Some(code)
}

#[derive(Clone)]
pub struct ShareCodeIndex {
    records: Arc<dyn RecordStore>,
    expiry: ExpiryPolicy,
    generator: Arc<dyn CodeGenerator>,
    max_attempts: u32,
}

impl ShareCodeIndex {
    pub fn new(
        records: Arc<dyn RecordStore>,
        expiry: ExpiryPolicy,
        generator: Arc<dyn CodeGenerator>,
        max_attempts: u32,
    ) -> Self {
        Self {
            records,
            expiry,
            generator,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pick a code no active record holds.
    ///
    /// A candidate held by an expired record is freed by purging that record.
    /// The returned code is only a candidate: the insert that claims it can
    /// still lose a race and must be retried by the caller.
    pub async fn allocate(&self, now: DateTime<Utc>) -> ShareResult<String> {
        for attempt in 1..=self.max_attempts {
            let candidate = self.generator.generate();
            match self.records.find_by_code(&candidate).await? {
                None => {
                    debug!(attempt, "allocated share code");
                    return Ok(candidate);
                }
                Some(holder) if ExpiryPolicy::is_expired(&holder, now) => {
                    self.expiry.purge(&holder).await?;
                    info!(code = %candidate, id = %holder.id, "reclaimed code from expired share");
                    return Ok(candidate);
                }
                Some(_) => {
                    debug!(attempt, "share code collision, regenerating");
                }
            }
        }

        warn!(attempts = self.max_attempts, "share code allocation exhausted");
        Err(ShareError::CapacityExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Resolve a code to its live record.
    ///
    /// Malformed, unknown, consumed and expired codes all read as not found.
    /// Expired records are purged on the way out.
    pub async fn resolve(&self, raw: &str, now: DateTime<Utc>) -> ShareResult<FileRecord> {
        let not_found = || ShareError::NotFound(format!("share code `{raw}`"));
        let code = normalize_code(raw).ok_or_else(not_found)?;
        let record = self.records.find_by_code(&code).await?.ok_or_else(not_found)?;

        if ExpiryPolicy::is_expired(&record, now) {
            if let Err(err) = self.expiry.purge(&record).await {
                warn!(id = %record.id, "failed to purge expired share: {}", err);
            }
            return Err(not_found());
        }
        Ok(record)
    }
}
