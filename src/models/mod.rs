//! Core data models for the share storage service.
//!
//! `FileRecord` is the row persisted by the record store; `Manifest` and
//! `StoredObject` describe how payload bytes are laid out in the chunk store.
//! All of them serialize as JSON via `serde`.

pub mod api;
pub mod file_record;
pub mod manifest;

pub use file_record::{FileRecord, RecordPage};
pub use manifest::{ChunkRef, Manifest, StoredObject};
