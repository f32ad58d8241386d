//! HTTP handlers for uploading, resolving and downloading shares.
//! Upload bodies are streamed straight into the assembler and downloads are
//! streamed out of it, so neither side buffers a whole file.

use crate::{
    errors::AppError,
    models::{
        FileRecord,
        api::{ApiResponse, UploadedShare},
    },
    services::{
        Download, ShareError, ShareService, UploadRequest, WrittenObject,
        expiry::ShareDuration,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::{StreamExt, stream};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::io;
use tracing::{debug, warn};
use uuid::Uuid;

/// Characters left readable in the `Content-Disposition` filename.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'-').remove(b'_');

/// `PUT /files` with a multipart form.
///
/// Fields: `file` (required), `isEphemeral`, `isEncrypted`, `duration`.
/// Flag fields may arrive before or after `file`; they are applied when the
/// record is published.
pub async fn upload_file(
    State(service): State<ShareService>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<UploadedShare>>, AppError> {
    let mut request = UploadRequest::default();
    let mut written = None;

    if let Err(err) = read_form(&service, &mut multipart, &mut request, &mut written).await {
        if let Some(object) = written {
            discard(&service, &object).await;
        }
        return Err(err);
    }

    let Some(object) = written else {
        return Err(AppError::bad_request("missing `file` field"));
    };
    let record = service.publish(object, request).await?;

    Ok(Json(ApiResponse::ok(UploadedShare {
        hash: record.hash,
        code: record.code,
        due_date: record.due_date.timestamp_millis(),
        is_encrypted: record.is_encrypted,
    })))
}

async fn read_form(
    service: &ShareService,
    multipart: &mut Multipart,
    request: &mut UploadRequest,
    written: &mut Option<WrittenObject>,
) -> Result<(), AppError> {
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                if written.is_some() {
                    return Err(AppError::bad_request("more than one `file` field"));
                }
                if let Some(filename) = field.file_name().filter(|f| !f.trim().is_empty()) {
                    request.filename = filename.to_string();
                }
                request.content_type = field.content_type().map(str::to_string);

                let body = field.map(|chunk| chunk.map_err(io::Error::other));
                *written = Some(service.store_object(body).await?);
            }
            "isEphemeral" => {
                request.is_ephemeral = parse_flag(&field.text().await.map_err(bad_multipart)?)
            }
            "isEncrypted" => {
                request.is_encrypted = parse_flag(&field.text().await.map_err(bad_multipart)?)
            }
            "duration" => {
                let raw = field.text().await.map_err(bad_multipart)?;
                request.duration = parse_duration(&raw);
            }
            _ => debug!(field = %name, "ignoring unknown form field"),
        }
    }
    Ok(())
}

async fn discard(service: &ShareService, object: &WrittenObject) {
    if let Err(err) = service.assembler().delete(&object.object_id).await {
        warn!(object_id = %object.object_id, "failed to discard upload: {}", err);
    }
}

fn bad_multipart(err: MultipartError) -> AppError {
    AppError::bad_request(format!("invalid multipart body: {err}"))
}

/// Form flags arrive JSON-encoded (`true`) or as plain text.
fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    serde_json::from_str::<bool>(raw).unwrap_or_else(|_| raw.eq_ignore_ascii_case("true"))
}

/// Durations arrive JSON-encoded (`"3day"`) or as plain text.
fn parse_duration(raw: &str) -> ShareDuration {
    let raw = raw.trim();
    match serde_json::from_str::<String>(raw) {
        Ok(decoded) => ShareDuration::parse(&decoded),
        Err(_) => ShareDuration::parse(raw),
    }
}

/// `GET /files/share/{code}` resolves a share code to its record.
pub async fn resolve_share(
    State(service): State<ShareService>,
    Path(code): Path<String>,
) -> Result<Json<ApiResponse<FileRecord>>, AppError> {
    let record = service.resolve_code(&code).await?;
    Ok(Json(ApiResponse::ok(record)))
}

/// `GET /files/{id}` streams the file.
///
/// The first chunk is fetched before the response starts so a damaged object
/// is reported as a 500 instead of a truncated 200. Later faults abort the
/// body.
pub async fn download_file(
    State(service): State<ShareService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = Uuid::parse_str(&id).map_err(|_| AppError::not_found("file not found"))?;
    let Download { record, mut body } = service.download(id).await?;

    let first = match body.next().await {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(err)) => return Err(err.into()),
        None => None,
    };
    let stream = stream::iter(first.map(Ok::<_, ShareError>))
        .chain(body)
        .map(|item| item.map_err(io::Error::other));

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &record)?;
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, record: &FileRecord) -> Result<(), AppError> {
    let content_type = HeaderValue::from_str(&record.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size));

    let filename = utf8_percent_encode(&record.filename, FILENAME_ENCODE_SET);
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .map_err(|err| AppError::internal(format!("invalid content disposition: {err}")))?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(())
}
