use crate::services::error::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Bad Request: {0}")]
    BadRequest(String),
}

fn upload_status(err: &UploadError) -> StatusCode {
    match err {
        UploadError::InvalidSize(_) | UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        UploadError::NotFound(_) => StatusCode::NOT_FOUND,
        UploadError::Expired(_) => StatusCode::GONE,
        UploadError::Conflict { .. }
        | UploadError::IncompleteUpload { .. }
        | UploadError::Integrity { .. } => StatusCode::CONFLICT,
        UploadError::InvalidChunkIndex { .. }
        | UploadError::SizeMismatch { .. }
        | UploadError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        UploadError::StorageBackend(_) | UploadError::Database(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Variant-specific fields merged into the error body.
fn upload_details(err: &UploadError) -> Value {
    match err {
        UploadError::Conflict { expected, actual } => json!({
            "expected": expected,
            "actual": actual,
        }),
        UploadError::InvalidChunkIndex {
            index,
            total_chunks,
        } => json!({
            "chunk_index": index,
            "total_chunks": total_chunks,
        }),
        UploadError::SizeMismatch {
            index,
            expected,
            actual,
        } => json!({
            "chunk_index": index,
            "expected": expected,
            "actual": actual,
        }),
        UploadError::ChecksumMismatch {
            index,
            expected,
            actual,
        } => json!({
            "chunk_index": index,
            "expected": expected,
            "actual": actual,
        }),
        UploadError::IncompleteUpload { missing_indices } => json!({
            "missing_indices": missing_indices,
        }),
        UploadError::Integrity {
            expected,
            actual,
            corrupt_chunks,
        } => json!({
            "expected": expected,
            "actual": actual,
            "corrupt_chunks": corrupt_chunks,
        }),
        _ => json!({}),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self {
            AppError::Upload(e) => {
                let status = upload_status(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!("Upload engine error: {:?}", e);
                    (
                        status,
                        e.code(),
                        "Internal Server Error".to_string(),
                        json!({}),
                    )
                } else {
                    (status, e.code(), e.to_string(), upload_details(&e))
                }
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "InvalidRequestError", msg, json!({})),
        };

        let mut body = json!({
            "error": code,
            "message": message,
        });
        if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), details) {
            body.extend(extra);
        }

        (status, Json(body)).into_response()
    }
}
