use crate::{models::api::ApiResponse, services::ShareError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;
use tracing::error;

/// HTTP-facing error: a status plus the message returned in the envelope.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::failure(self.message))).into_response()
    }
}

impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        match err {
            ShareError::NotFound(_) => AppError::not_found("file not found"),
            ShareError::BadRequest(msg) => AppError::bad_request(msg),
            ShareError::TooLarge { limit } => AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("file exceeds the {limit} byte limit"),
            ),
            ShareError::CapacityExhausted { .. } => {
                error!("{}", err);
                AppError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "no share code available, try again later",
                )
            }
            other => {
                error!("request failed: {}", other);
                AppError::internal("internal server error")
            }
        }
    }
}
