//! Storage core: chunk planning, object assembly, records, codes and expiry.

pub mod assembler;
pub mod chunk_store;
pub mod error;
pub mod expiry;
pub mod planner;
pub mod record_store;
pub mod retry;
pub mod share_code;
pub mod share_service;

pub use assembler::{AssemblerOptions, ObjectAssembler, ObjectStream, WrittenObject};
pub use chunk_store::{ChunkStore, FilesystemChunkStore, MemoryChunkStore, StoreBackend};
pub use error::{ShareError, ShareResult};
pub use expiry::{ExpiryPolicy, ExpiryUpdate, ShareDuration};
pub use record_store::{RecordStore, SqliteRecordStore};
pub use share_code::{CodeGenerator, ShareCodeIndex};
pub use share_service::{Download, PurgeReport, ShareService, ShareSettings, UploadRequest};
