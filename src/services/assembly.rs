use crate::entities::upload_chunks;
use crate::models::{ChunkStatus, FinalObjectRef, SessionStatus, UploadSession};
use crate::services::error::{UploadError, UploadResult};
use crate::services::lifecycle::UploadLifecycle;
use crate::services::session_registry::SessionRegistry;
use crate::services::storage::{StorageBackend, StorageError, keys};
use crate::utils::hash::hashes_match;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

/// In-memory pipe between chunk reader and staging writer.
const PIPE_CAPACITY: usize = 1024 * 1024;
const READ_BUFFER: usize = 256 * 1024;

struct StreamOutcome {
    content_hash: String,
    size: u64,
    corrupt_chunks: Vec<u32>,
}

/// Turns a fully received session into one verified object.
///
/// Chunks are streamed in index order into a staging object while two hashes
/// run over the bytes: one per chunk, checked against the hash recorded at
/// upload, and one over the whole stream, checked against the declared
/// content hash. Only a verified staging object is renamed to its final key.
#[derive(Clone)]
pub struct AssemblyCoordinator {
    registry: SessionRegistry,
    storage: Arc<dyn StorageBackend>,
    lifecycle: UploadLifecycle,
}

impl AssemblyCoordinator {
    pub fn new(
        registry: SessionRegistry,
        storage: Arc<dyn StorageBackend>,
        lifecycle: UploadLifecycle,
    ) -> Self {
        Self {
            registry,
            storage,
            lifecycle,
        }
    }

    #[instrument(skip(self))]
    pub async fn complete(&self, session_id: &str) -> UploadResult<FinalObjectRef> {
        let session = self.registry.get_session(session_id).await?;
        if session.status != SessionStatus::Open {
            return Err(UploadError::Conflict {
                expected: SessionStatus::Open,
                actual: session.status,
            });
        }
        let assembly_id = self.registry.begin_assembly(session_id).await?;
        let staging_key = keys::assembly_key(session_id, &assembly_id);

        match self.assemble(&session, &assembly_id, &staging_key).await {
            Ok(final_ref) => {
                if let Err(e) = self.lifecycle.purge_session_data(session_id).await {
                    tracing::warn!(
                        "Committed session {} but chunk purge failed, reaper will retry: {}",
                        session_id,
                        e
                    );
                }
                Ok(final_ref)
            }
            Err(e) => {
                tracing::warn!("Assembly of session {} failed: {}", session_id, e);
                self.release(session_id, &assembly_id, &staging_key).await;
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        session: &UploadSession,
        assembly_id: &str,
        staging_key: &str,
    ) -> UploadResult<FinalObjectRef> {
        let session_id = session.session_id.as_str();

        let stored: BTreeMap<u32, upload_chunks::Model> = self
            .registry
            .list_chunks(session_id)
            .await?
            .into_iter()
            .filter(|c| c.status == ChunkStatus::Stored.as_str())
            .map(|c| (c.chunk_index as u32, c))
            .collect();

        let missing_indices: Vec<u32> = (0..session.total_chunks)
            .filter(|i| !stored.contains_key(i))
            .collect();
        if !missing_indices.is_empty() {
            return Err(UploadError::IncompleteUpload { missing_indices });
        }

        let outcome = self.stream_chunks(&stored, staging_key).await?;

        if !outcome.corrupt_chunks.is_empty()
            || outcome.size != session.total_size
            || !hashes_match(&outcome.content_hash, &session.content_hash)
        {
            tracing::error!(
                "Session {} failed verification: {} bytes (expected {}), hash {} (expected {}), corrupt chunks {:?}",
                session_id,
                outcome.size,
                session.total_size,
                outcome.content_hash,
                session.content_hash,
                outcome.corrupt_chunks
            );
            self.registry
                .mark_rejected(session_id, &outcome.corrupt_chunks)
                .await?;
            return Err(UploadError::Integrity {
                expected: session.content_hash.clone(),
                actual: outcome.content_hash,
                corrupt_chunks: outcome.corrupt_chunks,
            });
        }

        let final_key = keys::final_key(session_id, &session.file_name);
        self.storage.rename(staging_key, &final_key).await?;

        if let Err(e) = self
            .registry
            .commit(session_id, assembly_id, &final_key)
            .await
        {
            self.unpublish_after_lost_commit(session_id, &final_key, &e)
                .await;
            return Err(e);
        }

        tracing::info!(
            "Session {} assembled into {} ({} bytes)",
            session_id,
            final_key,
            outcome.size
        );
        Ok(FinalObjectRef {
            session_id: session_id.to_string(),
            key: final_key,
            size: outcome.size,
            content_hash: outcome.content_hash,
        })
    }

    /// Pipes every chunk, in order, into `put(staging_key)`.
    async fn stream_chunks(
        &self,
        chunks: &BTreeMap<u32, upload_chunks::Model>,
        staging_key: &str,
    ) -> UploadResult<StreamOutcome> {
        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);

        let producer = async move {
            let mut file_hasher = Sha256::new();
            let mut size = 0u64;
            let mut corrupt_chunks = Vec::new();
            let mut buffer = vec![0u8; READ_BUFFER];

            for (index, record) in chunks {
                let mut chunk_hasher = Sha256::new();
                let mut blob = self.storage.get(&record.storage_key).await?;
                loop {
                    let n = blob.read(&mut buffer).await.map_err(StorageError::Io)?;
                    if n == 0 {
                        break;
                    }
                    chunk_hasher.update(&buffer[..n]);
                    file_hasher.update(&buffer[..n]);
                    size += n as u64;
                    writer
                        .write_all(&buffer[..n])
                        .await
                        .map_err(StorageError::Io)?;
                }

                let chunk_hash = hex::encode(chunk_hasher.finalize());
                if !hashes_match(&chunk_hash, &record.chunk_hash) {
                    tracing::warn!(
                        "Chunk {} at {} no longer matches its recorded hash",
                        index,
                        record.storage_key
                    );
                    corrupt_chunks.push(*index);
                }
            }
            writer.shutdown().await.map_err(StorageError::Io)?;

            Ok::<_, UploadError>(StreamOutcome {
                content_hash: hex::encode(file_hasher.finalize()),
                size,
                corrupt_chunks,
            })
        };
        let consumer = self.storage.put(staging_key, Box::new(reader));

        let (produced, written) = tokio::join!(producer, consumer);
        // A failed writer shows up as a broken pipe on the producer side, so
        // report the storage error first.
        let written = written?;
        let outcome = produced?;
        if written != outcome.size {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "staging object {} has {} bytes, streamed {}",
                staging_key, written, outcome.size
            )))
            .into());
        }
        Ok(outcome)
    }

    /// Deletes the published object unless another attempt already committed
    /// the same verified bytes under that key.
    async fn unpublish_after_lost_commit(
        &self,
        session_id: &str,
        final_key: &str,
        err: &UploadError,
    ) {
        match err {
            UploadError::Conflict {
                actual: SessionStatus::Committed,
                ..
            } => {
                tracing::info!(
                    "Session {} was committed by another assembly, keeping {}",
                    session_id,
                    final_key
                );
            }
            UploadError::Conflict {
                actual: SessionStatus::Aborted | SessionStatus::Expired,
                ..
            } => {
                if let Err(e) = self.storage.delete(final_key).await {
                    tracing::error!("Failed to unpublish {}: {}", final_key, e);
                }
            }
            // Session is live again under a newer attempt which will
            // overwrite the key with identical bytes or discard it.
            _ => {}
        }
    }

    async fn release(&self, session_id: &str, assembly_id: &str, staging_key: &str) {
        if let Err(e) = self.storage.delete(staging_key).await {
            tracing::warn!("Failed to delete staging object {}: {}", staging_key, e);
        }
        match self.registry.release_assembly(session_id, assembly_id).await {
            Ok(true) => tracing::info!("Session {} reopened after failed assembly", session_id),
            Ok(false) => tracing::debug!(
                "Session {} no longer owned by assembly {}",
                session_id,
                assembly_id
            ),
            Err(e) => tracing::error!("Failed to reopen session {}: {}", session_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::infrastructure::database;
    use crate::services::chunk_receiver::ChunkReceiver;
    use crate::services::session_registry::NewSession;
    use crate::services::storage::MemoryStorageBackend;
    use crate::utils::hash::calculate_hash;
    use bytes::Bytes;
    use sea_orm::Database;

    struct Harness {
        registry: SessionRegistry,
        storage: Arc<MemoryStorageBackend>,
        receiver: ChunkReceiver,
        coordinator: AssemblyCoordinator,
    }

    async fn harness() -> Harness {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        database::run_migrations(&db).await.unwrap();
        let registry = SessionRegistry::new(db, UploadConfig::development());
        let storage = Arc::new(MemoryStorageBackend::new());
        let lifecycle = UploadLifecycle::new(registry.clone(), storage.clone());
        Harness {
            receiver: ChunkReceiver::new(registry.clone(), storage.clone()),
            coordinator: AssemblyCoordinator::new(registry.clone(), storage.clone(), lifecycle),
            registry,
            storage,
        }
    }

    async fn start(h: &Harness, content: &[u8], chunk_size: i64) -> String {
        h.registry
            .create_session(NewSession {
                file_name: "payload.bin".to_string(),
                total_size: content.len() as i64,
                chunk_size,
                content_hash: calculate_hash(content),
            })
            .await
            .unwrap()
            .session_id
    }

    async fn send(h: &Harness, id: &str, content: &[u8], chunk_size: usize, index: usize) {
        let chunk = content.chunks(chunk_size).nth(index).unwrap();
        h.receiver
            .put_chunk(id, index as i64, Bytes::copy_from_slice(chunk), &calculate_hash(chunk))
            .await
            .unwrap();
    }

    async fn read_all(storage: &MemoryStorageBackend, key: &str) -> Vec<u8> {
        let mut out = Vec::new();
        storage
            .get(key)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_out_of_order_upload_assembles_in_index_order() {
        let h = harness().await;
        let content: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
        let id = start(&h, &content, 100).await;
        for index in [2, 0, 1] {
            send(&h, &id, &content, 100, index).await;
        }

        let final_ref = h.coordinator.complete(&id).await.unwrap();
        assert_eq!(final_ref.size, 250);
        assert_eq!(final_ref.content_hash, calculate_hash(&content));
        assert_eq!(read_all(&h.storage, &final_ref.key).await, content);

        // Only the final object remains.
        assert_eq!(h.storage.len(), 1);
        let session = h.registry.find_session(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Committed);
        assert_eq!(session.final_key.as_deref(), Some(final_ref.key.as_str()));
    }

    #[tokio::test]
    async fn test_missing_chunks_reopen_session() {
        let h = harness().await;
        let content = vec![9u8; 100];
        let id = start(&h, &content, 10).await;
        for index in (0..10).filter(|i| *i != 2 && *i != 5) {
            send(&h, &id, &content, 10, index).await;
        }

        let err = h.coordinator.complete(&id).await.unwrap_err();
        match err {
            UploadError::IncompleteUpload { missing_indices } => {
                assert_eq!(missing_indices, vec![2, 5])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            h.registry.find_session(&id).await.unwrap().status,
            SessionStatus::Open
        );

        send(&h, &id, &content, 10, 2).await;
        send(&h, &id, &content, 10, 5).await;
        h.coordinator.complete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_tampered_chunk_fails_integrity_and_is_rejected() {
        let h = harness().await;
        let content = b"0123456789abcdefghij".to_vec();
        let id = start(&h, &content, 5).await;
        for index in 0..4 {
            send(&h, &id, &content, 5, index).await;
        }

        h.storage
            .put(&keys::chunk_key(&id, 1), Box::new(&b"XXXXX"[..]))
            .await
            .unwrap();

        let err = h.coordinator.complete(&id).await.unwrap_err();
        match err {
            UploadError::Integrity { corrupt_chunks, .. } => assert_eq!(corrupt_chunks, vec![1]),
            other => panic!("unexpected error: {other}"),
        }

        let final_key = keys::final_key(&id, "payload.bin");
        assert!(!h.storage.exists(&final_key).await.unwrap());
        let session = h.registry.find_session(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Open);
        let chunks = h.registry.list_chunks(&id).await.unwrap();
        assert_eq!(chunks[1].status, "rejected");

        // No staging leftovers.
        let prefix = keys::session_prefix(&id);
        let leftovers = h.storage.list_by_prefix(&prefix).await.unwrap();
        assert!(leftovers.iter().all(|k| k.contains("/chunks/")));

        send(&h, &id, &content, 5, 1).await;
        let final_ref = h.coordinator.complete(&id).await.unwrap();
        assert_eq!(read_all(&h.storage, &final_ref.key).await, content);
    }

    #[tokio::test]
    async fn test_wrong_declared_hash_fails_without_publishing() {
        let h = harness().await;
        let content = vec![1u8; 30];
        let id = h
            .registry
            .create_session(NewSession {
                file_name: "payload.bin".to_string(),
                total_size: 30,
                chunk_size: 10,
                content_hash: calculate_hash(b"something else"),
            })
            .await
            .unwrap()
            .session_id;
        for index in 0..3 {
            send(&h, &id, &content, 10, index).await;
        }

        let err = h.coordinator.complete(&id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Integrity { ref corrupt_chunks, .. } if corrupt_chunks.is_empty()
        ));
        assert!(h.storage.list_by_prefix("objects/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_after_commit_conflicts() {
        let h = harness().await;
        let content = vec![4u8; 8];
        let id = start(&h, &content, 8).await;
        send(&h, &id, &content, 8, 0).await;
        h.coordinator.complete(&id).await.unwrap();

        let err = h.coordinator.complete(&id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Conflict {
                actual: SessionStatus::Committed,
                ..
            }
        ));
    }
}
