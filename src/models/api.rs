//! JSON envelope shared by every API response.

use serde::Serialize;

/// `{ "result": bool, "message": string, "data": T | null }`
#[derive(Serialize, Debug)]
pub struct ApiResponse<T> {
    pub result: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            result: true,
            message: "ok".into(),
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Returned to the uploader once a share has been published.
#[derive(Serialize, Debug)]
pub struct UploadedShare {
    pub hash: String,
    pub code: String,
    pub due_date: i64,
    pub is_encrypted: bool,
}
