//! Represents a shared upload as persisted by the record store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The durable description of an uploaded share.
///
/// A `FileRecord` never holds payload bytes. It references the object written
/// by the assembler through `object_id` and carries everything a client needs
/// to present and verify the download.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Primary handle, generated at upload time.
    pub id: Uuid,

    /// Short human-shareable code, unique among active records.
    pub code: String,

    /// Root key of the stored object in the chunk store.
    #[serde(rename = "objectId")]
    pub object_id: String,

    /// Original filename supplied by the uploader.
    pub filename: String,

    /// MIME type of the payload.
    #[serde(rename = "type")]
    pub content_type: String,

    /// Total byte length across all chunks.
    pub size: u64,

    /// MD5 digest (hex) of the stored bytes.
    pub hash: String,

    /// When the share stops being served. Permanent shares carry the
    /// far-future sentinel from `services::expiry::never`.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub due_date: DateTime<Utc>,

    /// Burn-after-read flag.
    pub is_ephemeral: bool,

    /// Payload is client-side ciphertext.
    pub is_encrypted: bool,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// One page of records for administrative listings.
#[derive(Serialize, Debug)]
pub struct RecordPage {
    pub items: Vec<FileRecord>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serializes_timestamps_as_millis_and_renames_type() {
        let created = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let record = FileRecord {
            id: Uuid::nil(),
            code: "ABC234".into(),
            object_id: Uuid::nil().to_string(),
            filename: "notes.txt".into(),
            content_type: "text/plain".into(),
            size: 12,
            hash: "d41d8cd98f00b204e9800998ecf8427e".into(),
            due_date: created,
            is_ephemeral: true,
            is_encrypted: false,
            created_at: created,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "text/plain");
        assert_eq!(json["objectId"], Uuid::nil().to_string());
        assert_eq!(json["due_date"], created.timestamp_millis());
        assert_eq!(json["created_at"], created.timestamp_millis());

        let back: FileRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
