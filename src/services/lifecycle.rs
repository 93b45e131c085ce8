use crate::models::{ChunkStatus, SessionStatus, SessionStatusReport, UploadSession};
use crate::services::error::{UploadError, UploadResult};
use crate::services::session_registry::SessionRegistry;
use crate::services::storage::{StorageBackend, StorageError, keys};
use futures::{StreamExt, stream};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What a purge removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub blobs_deleted: usize,
    pub records_deleted: u64,
}

/// Cleanup and inspection of session-scoped data.
#[derive(Clone)]
pub struct UploadLifecycle {
    registry: SessionRegistry,
    storage: Arc<dyn StorageBackend>,
}

impl UploadLifecycle {
    pub fn new(registry: SessionRegistry, storage: Arc<dyn StorageBackend>) -> Self {
        Self { registry, storage }
    }

    /// Deletes every blob under the session prefix, then the chunk records.
    ///
    /// Records are only dropped once all blob deletes succeeded, so a partial
    /// failure leaves the session visible to the reaper's orphan sweep.
    pub async fn purge_session_data(&self, session_id: &str) -> UploadResult<PurgeReport> {
        let prefix = keys::session_prefix(session_id);
        let blobs_deleted = self.delete_all(&prefix).await?;
        let records_deleted = self.registry.delete_chunks(session_id).await?;

        tracing::info!(
            "Purged session {}: {} blobs, {} chunk records",
            session_id,
            blobs_deleted,
            records_deleted
        );
        Ok(PurgeReport {
            blobs_deleted,
            records_deleted,
        })
    }

    /// Removes anything published under the session's object prefix. Used when
    /// a session ends without committing.
    pub async fn discard_published(&self, session_id: &str) -> UploadResult<usize> {
        self.delete_all(&keys::final_prefix(session_id)).await
    }

    /// Deletes every object under `prefix`, then whatever partial writes an
    /// interrupted `put` left there.
    async fn delete_all(&self, prefix: &str) -> UploadResult<usize> {
        let keys = self.storage.list_by_prefix(prefix).await?;

        let concurrency = self.registry.config().purge_concurrency.max(1);
        let results: Vec<(String, Result<(), StorageError>)> = stream::iter(keys)
            .map(|key| async move {
                let res = self.storage.delete(&key).await;
                (key, res)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut deleted = 0;
        let mut first_error = None;
        for (key, res) in results {
            match res {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!("Failed to delete blob {}: {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e.into());
        }

        let partial = self.storage.discard_incomplete(prefix).await?;
        Ok(deleted + partial)
    }

    /// Client-initiated cancel. Works from open or completing; an in-flight
    /// assembly loses its commit and cleans up after itself.
    pub async fn abort(&self, session_id: &str) -> UploadResult<()> {
        let session = self.registry.get_session(session_id).await?;

        if session.status.is_terminal() {
            return Err(UploadError::Conflict {
                expected: SessionStatus::Open,
                actual: session.status,
            });
        }
        let from = session.status;

        match self
            .registry
            .transition(session_id, from, SessionStatus::Aborted)
            .await
        {
            Ok(()) => {}
            // Raced with an assembly starting or finishing.
            Err(UploadError::Conflict { actual, .. })
                if actual == SessionStatus::Completing || actual == SessionStatus::Open =>
            {
                self.registry
                    .transition(session_id, actual, SessionStatus::Aborted)
                    .await?;
            }
            Err(UploadError::Conflict {
                actual: SessionStatus::Aborted | SessionStatus::Expired,
                ..
            }) => return Err(UploadError::Expired(session_id.to_string())),
            Err(e) => return Err(e),
        }

        tracing::info!("Aborted upload session {}", session_id);
        self.cleanup_abandoned(session_id).await;
        Ok(())
    }

    /// Best-effort purge for a session that ended without committing.
    /// Failures are left to the reaper.
    pub(crate) async fn cleanup_abandoned(&self, session_id: &str) {
        if let Err(e) = self.purge_session_data(session_id).await {
            tracing::warn!("Purge of session {} deferred to reaper: {}", session_id, e);
        }
        if let Err(e) = self.discard_published(session_id).await {
            tracing::warn!(
                "Failed to discard published objects of session {}: {}",
                session_id,
                e
            );
        }
    }

    pub async fn status(&self, session_id: &str) -> UploadResult<SessionStatusReport> {
        let session = self.registry.find_session(session_id).await?;
        let chunks = self.registry.list_chunks(session_id).await?;

        let mut received = BTreeSet::new();
        let mut rejected = Vec::new();
        let mut bytes_received = 0u64;
        for chunk in &chunks {
            let index = chunk.chunk_index as u32;
            if chunk.status == ChunkStatus::Stored.as_str() {
                received.insert(index);
                bytes_received += chunk.size as u64;
            } else {
                rejected.push(index);
            }
        }

        let missing_chunks = if session.status.is_terminal() {
            Vec::new()
        } else {
            (0..session.total_chunks)
                .filter(|i| !received.contains(i))
                .collect()
        };
        if session.status == SessionStatus::Committed {
            bytes_received = session.total_size;
        }

        Ok(report(session, received.into_iter().collect(), rejected, missing_chunks, bytes_received))
    }
}

fn report(
    session: UploadSession,
    received_chunks: Vec<u32>,
    rejected_chunks: Vec<u32>,
    missing_chunks: Vec<u32>,
    bytes_received: u64,
) -> SessionStatusReport {
    SessionStatusReport {
        session_id: session.session_id,
        file_name: session.file_name,
        status: session.status,
        total_size: session.total_size,
        chunk_size: session.chunk_size,
        total_chunks: session.total_chunks,
        received_chunks,
        rejected_chunks,
        missing_chunks,
        bytes_received,
        expires_at: session.expires_at,
        final_key: session.final_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadConfig;
    use crate::infrastructure::database;
    use crate::services::session_registry::{NewSession, StoredChunk};
    use crate::services::storage::MemoryStorageBackend;
    use crate::utils::hash::calculate_hash;
    use sea_orm::Database;

    async fn setup() -> (UploadLifecycle, SessionRegistry, Arc<MemoryStorageBackend>) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        database::run_migrations(&db).await.unwrap();
        let registry = SessionRegistry::new(db, UploadConfig::development());
        let storage = Arc::new(MemoryStorageBackend::new());
        let lifecycle = UploadLifecycle::new(registry.clone(), storage.clone());
        (lifecycle, registry, storage)
    }

    async fn open_session(registry: &SessionRegistry) -> String {
        registry
            .create_session(NewSession {
                file_name: "data.bin".to_string(),
                total_size: 30,
                chunk_size: 10,
                content_hash: calculate_hash(b"irrelevant"),
            })
            .await
            .unwrap()
            .session_id
    }

    async fn store_chunk(
        registry: &SessionRegistry,
        storage: &MemoryStorageBackend,
        id: &str,
        index: u32,
    ) {
        let key = keys::chunk_key(id, index);
        storage.put(&key, Box::new(&[7u8; 10][..])).await.unwrap();
        registry
            .upsert_chunk(StoredChunk {
                session_id: id.to_string(),
                chunk_index: index,
                chunk_hash: calculate_hash(&[7u8; 10]),
                size: 10,
                storage_key: key,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_purge_removes_blobs_and_records() {
        let (lifecycle, registry, storage) = setup().await;
        let id = open_session(&registry).await;
        store_chunk(&registry, &storage, &id, 0).await;
        store_chunk(&registry, &storage, &id, 2).await;

        let report = lifecycle.purge_session_data(&id).await.unwrap();
        assert_eq!(report.blobs_deleted, 2);
        assert_eq!(report.records_deleted, 2);
        assert!(storage.is_empty());
        assert!(registry.list_chunks(&id).await.unwrap().is_empty());

        // Second purge finds nothing and still succeeds.
        assert_eq!(
            lifecycle.purge_session_data(&id).await.unwrap(),
            PurgeReport::default()
        );
    }

    #[tokio::test]
    async fn test_status_lists_missing_chunks() {
        let (lifecycle, registry, storage) = setup().await;
        let id = open_session(&registry).await;
        store_chunk(&registry, &storage, &id, 1).await;
        registry
            .record_rejection(&id, 2, "bad", 10, &keys::chunk_key(&id, 2))
            .await
            .unwrap();

        let report = lifecycle.status(&id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Open);
        assert_eq!(report.received_chunks, vec![1]);
        assert_eq!(report.rejected_chunks, vec![2]);
        assert_eq!(report.missing_chunks, vec![0, 2]);
        assert_eq!(report.bytes_received, 10);
    }

    #[tokio::test]
    async fn test_abort_purges_and_leaves_tombstone() {
        let (lifecycle, registry, storage) = setup().await;
        let id = open_session(&registry).await;
        store_chunk(&registry, &storage, &id, 0).await;

        lifecycle.abort(&id).await.unwrap();

        assert!(storage.is_empty());
        assert_eq!(
            registry.find_session(&id).await.unwrap().status,
            SessionStatus::Aborted
        );
        assert!(matches!(
            lifecycle.abort(&id).await.unwrap_err(),
            UploadError::Expired(_)
        ));
    }

    #[tokio::test]
    async fn test_abort_committed_session_conflicts() {
        let (lifecycle, registry, _storage) = setup().await;
        let id = open_session(&registry).await;
        let token = registry.begin_assembly(&id).await.unwrap();
        registry.commit(&id, &token, "objects/x/data.bin").await.unwrap();

        let err = lifecycle.abort(&id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Conflict {
                actual: SessionStatus::Committed,
                ..
            }
        ));
    }
}
