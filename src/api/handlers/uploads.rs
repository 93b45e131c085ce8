use crate::AppState;
use crate::api::error::AppError;
use crate::models::{ChunkReceipt, FinalObjectRef, SessionStatusReport};
use crate::services::session_registry::NewSession;
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Header carrying the hex SHA-256 of a chunk body.
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";

#[derive(Deserialize, ToSchema, Validate)]
pub struct CreateUploadRequest {
    #[validate(length(min = 1, max = 1024, message = "file_name must not be empty"))]
    pub file_name: String,
    pub total_size: i64,
    pub chunk_size: i64,
    #[validate(length(min = 64, max = 64, message = "Invalid hash format"))]
    pub content_hash: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateUploadResponse {
    pub session_id: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    #[schema(value_type = String)]
    pub expires_at: DateTime<FixedOffset>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct OpenSessionSummary {
    pub session_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    #[schema(value_type = String)]
    pub expires_at: DateTime<FixedOffset>,
}

#[utoipa::path(
    post,
    path = "/uploads",
    request_body = CreateUploadRequest,
    responses(
        (status = 201, description = "Upload session opened", body = CreateUploadResponse),
        (status = 400, description = "Invalid size or request")
    ),
    tag = "uploads"
)]
pub async fn create_upload(
    State(state): State<AppState>,
    Json(req): Json<CreateUploadRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate().map_err(|e| AppError::BadRequest(e.to_string()))?;

    let session = state
        .upload_service
        .create_session(NewSession {
            file_name: req.file_name,
            total_size: req.total_size,
            chunk_size: req.chunk_size,
            content_hash: req.content_hash,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUploadResponse {
            session_id: session.session_id,
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
            expires_at: session.expires_at,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/uploads",
    responses(
        (status = 200, description = "Open upload sessions", body = Vec<OpenSessionSummary>)
    ),
    tag = "uploads"
)]
pub async fn list_uploads(
    State(state): State<AppState>,
) -> Result<Json<Vec<OpenSessionSummary>>, AppError> {
    let sessions = state.upload_service.list_open_sessions().await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| OpenSessionSummary {
                session_id: s.session_id,
                file_name: s.file_name,
                total_size: s.total_size,
                total_chunks: s.total_chunks,
                expires_at: s.expires_at,
            })
            .collect(),
    ))
}

#[utoipa::path(
    put,
    path = "/uploads/{session_id}/chunks/{index}",
    params(
        ("session_id" = String, Path, description = "Upload session ID"),
        ("index" = i64, Path, description = "Zero-based chunk index"),
        ("x-chunk-checksum" = String, Header, description = "Hex SHA-256 of the chunk body")
    ),
    request_body(content = Vec<u8>, description = "Raw chunk bytes", content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Chunk stored", body = ChunkReceipt),
        (status = 400, description = "Missing or malformed checksum"),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "Session not accepting chunks"),
        (status = 410, description = "Session expired or aborted"),
        (status = 422, description = "Size, checksum or index rejected")
    ),
    tag = "uploads"
)]
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(String, i64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkReceipt>, AppError> {
    let checksum = headers
        .get(CHUNK_CHECKSUM_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::BadRequest(format!("missing {} header", CHUNK_CHECKSUM_HEADER))
        })?;

    let receipt = state
        .upload_service
        .put_chunk(&session_id, index, body, checksum.trim())
        .await?;
    Ok(Json(receipt))
}

#[utoipa::path(
    post,
    path = "/uploads/{session_id}/complete",
    params(
        ("session_id" = String, Path, description = "Upload session ID")
    ),
    responses(
        (status = 200, description = "Object assembled and verified", body = FinalObjectRef),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "Missing chunks, integrity failure or wrong state"),
        (status = 410, description = "Session expired or aborted")
    ),
    tag = "uploads"
)]
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<FinalObjectRef>, AppError> {
    let final_ref = state.upload_service.complete(&session_id).await?;
    Ok(Json(final_ref))
}

#[utoipa::path(
    get,
    path = "/uploads/{session_id}/status",
    params(
        ("session_id" = String, Path, description = "Upload session ID")
    ),
    responses(
        (status = 200, description = "Session progress", body = SessionStatusReport),
        (status = 404, description = "Unknown session")
    ),
    tag = "uploads"
)]
pub async fn upload_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusReport>, AppError> {
    Ok(Json(state.upload_service.status(&session_id).await?))
}

#[utoipa::path(
    delete,
    path = "/uploads/{session_id}",
    params(
        ("session_id" = String, Path, description = "Upload session ID")
    ),
    responses(
        (status = 204, description = "Session aborted"),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "Session already committed"),
        (status = 410, description = "Session already expired or aborted")
    ),
    tag = "uploads"
)]
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.upload_service.abort(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
