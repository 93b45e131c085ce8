use crate::models::SessionStatus;
use crate::services::storage::StorageError;
use thiserror::Error;

/// Everything the upload engine can report back to a caller.
///
/// Per-chunk variants are always retryable by re-sending the chunk. Completion
/// variants leave the session open so the client can patch and retry.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upload session {0} not found")]
    NotFound(String),

    #[error("upload session {0} has expired or was aborted")]
    Expired(String),

    #[error("upload session is {actual}, expected {expected}")]
    Conflict {
        expected: SessionStatus,
        actual: SessionStatus,
    },

    #[error("chunk index {index} out of range (total chunks: {total_chunks})")]
    InvalidChunkIndex { index: i64, total_chunks: u32 },

    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("chunk {index} checksum mismatch: declared {expected}, computed {actual}")]
    ChecksumMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("upload incomplete, missing chunks {missing_indices:?}")]
    IncompleteUpload { missing_indices: Vec<u32> },

    #[error("assembled object failed verification: expected {expected}, computed {actual}")]
    Integrity {
        expected: String,
        actual: String,
        corrupt_chunks: Vec<u32>,
    },

    #[error("storage backend error: {0}")]
    StorageBackend(#[from] StorageError),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl UploadError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSize(_) => "InvalidSizeError",
            Self::InvalidRequest(_) => "InvalidRequestError",
            Self::NotFound(_) => "NotFoundError",
            Self::Expired(_) => "ExpiredError",
            Self::Conflict { .. } => "ConflictError",
            Self::InvalidChunkIndex { .. } => "InvalidChunkIndexError",
            Self::SizeMismatch { .. } => "SizeMismatchError",
            Self::ChecksumMismatch { .. } => "ChecksumMismatchError",
            Self::IncompleteUpload { .. } => "IncompleteUploadError",
            Self::Integrity { .. } => "IntegrityError",
            Self::StorageBackend(_) => "StorageBackendError",
            Self::Database(_) => "DatabaseError",
        }
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
