//! Chunked object storage for a file sharing service.
//!
//! Uploads are split into bounded chunks behind a manifest, bound to a short
//! share code, and expire on a due date or after a single complete read.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
