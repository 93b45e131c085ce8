//! Blob storage behind a narrow key/value interface.
//!
//! The upload engine only ever talks to [`StorageBackend`]; which concrete
//! store sits behind it is decided by configuration at startup.

pub mod keys;
pub mod local;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use local::LocalStorageBackend;
pub use memory::MemoryStorageBackend;
pub use s3::S3StorageBackend;

/// Streaming read handle returned by [`StorageBackend::get`].
pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short identifier used in logs and health output.
    fn name(&self) -> &'static str;

    /// Write the full contents of `reader` under `key`, replacing any
    /// existing object. Returns the number of bytes written.
    async fn put<'a>(
        &self,
        key: &str,
        reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> StorageResult<u64>;

    async fn get(&self, key: &str) -> StorageResult<BlobReader>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Move an object to a new key; the destination only becomes visible
    /// once it holds the complete source object.
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Removes partial writes that interrupted `put` calls left under
    /// `prefix`, along with any directory-like structure the prefix leaves
    /// empty. Returns how many partial writes were reclaimed.
    async fn discard_incomplete(&self, _prefix: &str) -> StorageResult<usize> {
        Ok(0)
    }
}

/// Rejects keys that could escape a namespace on path-like backends.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    if key.starts_with('/') || key.starts_with('\\') || key.contains('\\') {
        return Err(StorageError::InvalidKey(format!(
            "absolute or backslash path not allowed: {key}"
        )));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }
    Ok(())
}
