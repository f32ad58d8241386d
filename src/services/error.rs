//! Error taxonomy for the storage core.

use crate::services::{chunk_store::StoreError, planner::PlanError, record_store::RecordError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShareError {
    /// Absent, expired or already consumed. Users see all three the same way.
    #[error("{0} not found")]
    NotFound(String),

    /// A manifest was found but the chunks it names are missing or damaged.
    #[error("object `{object_id}` is corrupted: {reason}")]
    IntegrityFault { object_id: String, reason: String },

    /// Share code allocation ran out of attempts.
    #[error("no free share code after {attempts} attempts")]
    CapacityExhausted { attempts: u32 },

    /// A chunk or manifest write did not durably succeed.
    #[error("failed to write object `{object_id}`: {reason}")]
    WriteFailure { object_id: String, reason: String },

    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

pub type ShareResult<T> = Result<T, ShareError>;

impl ShareError {
    pub(crate) fn write_failure(object_id: &str, reason: impl ToString) -> Self {
        Self::WriteFailure {
            object_id: object_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn integrity(object_id: &str, reason: impl Into<String>) -> Self {
        Self::IntegrityFault {
            object_id: object_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
