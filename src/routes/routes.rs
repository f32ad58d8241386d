//! Routes for the share API.
//!
//! - `PUT /files`                multipart upload, returns the share code
//! - `GET /files/share/{code}`   resolve a share code to its record
//! - `GET /files/{id}`           stream the file
//! - `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        share_handlers::{download_file, resolve_share, upload_file},
    },
    services::ShareService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, put},
};

/// Build the router. Handlers share a `ShareService` as state.
///
/// The default request body limit is lifted; upload size is enforced by the
/// assembler while streaming.
pub fn routes() -> Router<ShareService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/files", put(upload_file))
        .route("/files/share/{code}", get(resolve_share))
        .route("/files/{id}", get(download_file))
        .layer(DefaultBodyLimit::disable())
}
