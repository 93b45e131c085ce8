use crate::models::{ChunkReceipt, SessionStatus};
use crate::services::error::{UploadError, UploadResult};
use crate::services::session_registry::{SessionRegistry, StoredChunk};
use crate::services::storage::{StorageBackend, keys};
use crate::utils::hash::{calculate_hash, hashes_match, is_sha256_hex};
use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;
use tracing::instrument;

/// Validates and persists individual chunks.
///
/// Chunks may arrive in any order and any number of times. A re-sent chunk
/// replaces the stored bytes and record for its index.
#[derive(Clone)]
pub struct ChunkReceiver {
    registry: SessionRegistry,
    storage: Arc<dyn StorageBackend>,
}

impl ChunkReceiver {
    pub fn new(registry: SessionRegistry, storage: Arc<dyn StorageBackend>) -> Self {
        Self { registry, storage }
    }

    #[instrument(skip(self, data, declared_hash), fields(size = data.len()))]
    pub async fn put_chunk(
        &self,
        session_id: &str,
        chunk_index: i64,
        data: Bytes,
        declared_hash: &str,
    ) -> UploadResult<ChunkReceipt> {
        let session = self.registry.get_session(session_id).await?;
        if session.status != SessionStatus::Open {
            return Err(UploadError::Conflict {
                expected: SessionStatus::Open,
                actual: session.status,
            });
        }

        if chunk_index < 0 || chunk_index >= i64::from(session.total_chunks) {
            return Err(UploadError::InvalidChunkIndex {
                index: chunk_index,
                total_chunks: session.total_chunks,
            });
        }
        let index = chunk_index as u32;

        if !is_sha256_hex(declared_hash) {
            return Err(UploadError::InvalidRequest(format!(
                "chunk {} checksum must be a hex-encoded SHA-256 digest",
                index
            )));
        }
        let declared_hash = declared_hash.to_lowercase();
        let storage_key = keys::chunk_key(session_id, index);

        let expected = session.expected_chunk_size(index);
        let actual = data.len() as u64;
        if actual != expected {
            self.note_rejection(session_id, index, &declared_hash, actual, &storage_key)
                .await;
            return Err(UploadError::SizeMismatch {
                index,
                expected,
                actual,
            });
        }

        let computed = calculate_hash(&data);
        if !hashes_match(&computed, &declared_hash) {
            self.note_rejection(session_id, index, &computed, actual, &storage_key)
                .await;
            return Err(UploadError::ChecksumMismatch {
                index,
                expected: declared_hash,
                actual: computed,
            });
        }

        let written = self.storage.put(&storage_key, Box::new(Cursor::new(data))).await?;
        if written != actual {
            return Err(UploadError::StorageBackend(
                std::io::Error::other(format!(
                    "short write for {}: {} of {} bytes",
                    storage_key, written, actual
                ))
                .into(),
            ));
        }

        self.registry
            .upsert_chunk(StoredChunk {
                session_id: session_id.to_string(),
                chunk_index: index,
                chunk_hash: computed.clone(),
                size: actual,
                storage_key,
            })
            .await?;
        self.registry.touch(session_id).await?;

        tracing::debug!("Stored chunk {} of session {}", index, session_id);
        Ok(ChunkReceipt {
            session_id: session_id.to_string(),
            chunk_index: index,
            size: actual,
            chunk_hash: computed,
        })
    }

    async fn note_rejection(
        &self,
        session_id: &str,
        index: u32,
        hash: &str,
        size: u64,
        storage_key: &str,
    ) {
        tracing::warn!("Rejected chunk {} of session {}", index, session_id);
        if let Err(e) = self
            .registry
            .record_rejection(session_id, index, hash, size, storage_key)
            .await
        {
            tracing::error!(
                "Failed to record rejection of chunk {} in session {}: {}",
                index,
                session_id,
                e
            );
        }
    }
}
