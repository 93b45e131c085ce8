use crate::models::SessionStatus;
use crate::services::error::{UploadError, UploadResult};
use crate::services::lifecycle::UploadLifecycle;
use crate::services::session_registry::SessionRegistry;
use crate::services::storage::{StorageBackend, keys};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub reverted: usize,
    pub orphans_purged: usize,
    pub retired: u64,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Background sweeper for abandoned sessions.
///
/// Each sweep expires idle sessions, reopens assemblies that stalled past the
/// grace period, retries purges that failed earlier and finally drops old
/// terminal tombstones. Safe to run in several processes at once; every state
/// change is a compare-and-set in the registry.
pub struct ExpiryReaper {
    registry: SessionRegistry,
    storage: Arc<dyn StorageBackend>,
    lifecycle: UploadLifecycle,
}

impl ExpiryReaper {
    pub fn new(registry: SessionRegistry, storage: Arc<dyn StorageBackend>) -> Self {
        let lifecycle = UploadLifecycle::new(registry.clone(), storage.clone());
        Self {
            registry,
            storage,
            lifecycle,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.registry.config().reaper_interval_secs.max(1));
        tracing::info!("🚀 Expiry reaper started (interval {:?})", interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("🛑 Expiry reaper shutting down");
                    break;
                }
                _ = sleep(interval) => {
                    match self.sweep_once().await {
                        Ok(report) if report.is_empty() => {}
                        Ok(report) => tracing::info!("🧹 Reaper sweep: {:?}", report),
                        Err(e) => tracing::error!("Reaper sweep failed: {}", e),
                    }
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> UploadResult<ReapReport> {
        self.sweep_at(Utc::now()).await
    }

    /// One sweep, treating `now` as the current time.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> UploadResult<ReapReport> {
        let now = now.fixed_offset();
        let config = self.registry.config();
        let mut report = ReapReport::default();

        // 1. Expire idle sessions
        for session in self.registry.expired_sessions(now).await? {
            let id = session.session_id.as_str();
            match self
                .registry
                .transition(id, session.status, SessionStatus::Expired)
                .await
            {
                Ok(()) => {
                    report.expired += 1;
                    self.lifecycle.cleanup_abandoned(id).await;
                }
                Err(UploadError::Conflict { actual, .. }) => {
                    tracing::debug!("Session {} moved to {} before expiry", id, actual);
                }
                Err(e) => tracing::error!("Failed to expire session {}: {}", id, e),
            }
        }

        // 2. Reopen stalled assemblies
        let cutoff = now - config.completing_grace();
        for session in self.registry.stalled_completions(cutoff).await? {
            let id = session.session_id.as_str();
            let assembly_id = session.assembly_id.as_deref();
            match self
                .registry
                .reclaim_stalled_assembly(id, assembly_id, cutoff)
                .await
            {
                Ok(true) => {
                    report.reverted += 1;
                    if let Some(assembly_id) = assembly_id {
                        self.discard_staging(&keys::assembly_key(id, assembly_id)).await;
                    }
                }
                Ok(false) => {
                    tracing::debug!("Session {} left its stalled assembly before revert", id);
                }
                Err(e) => tracing::error!("Failed to reopen session {}: {}", id, e),
            }
        }

        // 3. Retry purges that failed earlier
        for session in self.registry.terminal_sessions_with_chunks().await? {
            let id = session.session_id.as_str();
            match self.lifecycle.purge_session_data(id).await {
                Ok(_) => report.orphans_purged += 1,
                Err(e) => tracing::warn!("Orphan purge of session {} failed: {}", id, e),
            }
        }

        // 4. Drop old tombstones
        report.retired = self
            .registry
            .delete_terminal_sessions_before(now - config.terminal_retention())
            .await?;

        Ok(report)
    }

    /// Removes a dead attempt's staging object and any partial write of it.
    async fn discard_staging(&self, staging: &str) {
        if let Err(e) = self.storage.delete(staging).await {
            tracing::warn!("Failed to delete staging object {}: {}", staging, e);
        }
        if let Err(e) = self.storage.discard_incomplete(staging).await {
            tracing::warn!("Failed to discard partial staging writes {}: {}", staging, e);
        }
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

    async fn setup() -> (ExpiryReaper, SessionRegistry, Arc<MemoryStorageBackend>) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        database::run_migrations(&db).await.unwrap();
        let registry = SessionRegistry::new(db, UploadConfig::development());
        let storage = Arc::new(MemoryStorageBackend::new());
        (
            ExpiryReaper::new(registry.clone(), storage.clone()),
            registry,
            storage,
        )
    }

    async fn session_with_chunk(
        registry: &SessionRegistry,
        storage: &MemoryStorageBackend,
    ) -> String {
        let id = registry
            .create_session(NewSession {
                file_name: "a.bin".to_string(),
                total_size: 8,
                chunk_size: 4,
                content_hash: calculate_hash(b"ignored"),
            })
            .await
            .unwrap()
            .session_id;
        let key = keys::chunk_key(&id, 0);
        storage.put(&key, Box::new(&b"abcd"[..])).await.unwrap();
        registry
            .upsert_chunk(StoredChunk {
                session_id: id.clone(),
                chunk_index: 0,
                chunk_hash: calculate_hash(b"abcd"),
                size: 4,
                storage_key: key,
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_sweep_leaves_fresh_sessions_alone() {
        let (reaper, registry, storage) = setup().await;
        let id = session_with_chunk(&registry, &storage).await;

        let report = reaper.sweep_once().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(
            registry.find_session(&id).await.unwrap().status,
            SessionStatus::Open
        );
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_sessions_and_purges() {
        let (reaper, registry, storage) = setup().await;
        let id = session_with_chunk(&registry, &storage).await;
        let ttl = registry.config().session_ttl();

        let report = reaper
            .sweep_at(Utc::now() + ttl + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
        assert!(storage.is_empty());
        assert!(registry.list_chunks(&id).await.unwrap().is_empty());
        assert_eq!(
            registry.find_session(&id).await.unwrap().status,
            SessionStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_sweep_reopens_stalled_assembly() {
        let (reaper, registry, storage) = setup().await;
        let id = session_with_chunk(&registry, &storage).await;
        let assembly_id = registry.begin_assembly(&id).await.unwrap();
        let staging = keys::assembly_key(&id, &assembly_id);
        storage.put(&staging, Box::new(&b"ab"[..])).await.unwrap();

        let grace = registry.config().completing_grace();
        let report = reaper
            .sweep_at(Utc::now() + grace + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.reverted, 1);
        assert!(!storage.exists(&staging).await.unwrap());
        assert_eq!(
            registry.find_session(&id).await.unwrap().status,
            SessionStatus::Open
        );
    }

    #[tokio::test]
    async fn test_sweep_retries_orphaned_chunks_then_retires_tombstone() {
        let (reaper, registry, storage) = setup().await;
        let id = session_with_chunk(&registry, &storage).await;
        // Aborted without a purge, as if the process died mid-cleanup.
        registry
            .transition(&id, SessionStatus::Open, SessionStatus::Aborted)
            .await
            .unwrap();

        let report = reaper.sweep_once().await.unwrap();
        assert_eq!(report.orphans_purged, 1);
        assert_eq!(report.retired, 0);
        assert!(storage.is_empty());

        let retention = registry.config().terminal_retention();
        let report = reaper
            .sweep_at(Utc::now() + retention + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.retired, 1);
        assert!(matches!(
            registry.find_session(&id).await.unwrap_err(),
            UploadError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_crashed_staging_write_is_reclaimed_on_disk() {
        use crate::services::storage::LocalStorageBackend;

        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect("sqlite::memory:").await.unwrap();
        database::run_migrations(&db).await.unwrap();
        let registry = SessionRegistry::new(db, UploadConfig::development());
        let storage = Arc::new(LocalStorageBackend::new(dir.path()).await.unwrap());
        let reaper = ExpiryReaper::new(registry.clone(), storage.clone());

        let id = registry
            .create_session(NewSession {
                file_name: "a.bin".to_string(),
                total_size: 8,
                chunk_size: 4,
                content_hash: calculate_hash(b"ignored"),
            })
            .await
            .unwrap()
            .session_id;
        let key = keys::chunk_key(&id, 0);
        storage.put(&key, Box::new(&b"abcd"[..])).await.unwrap();
        registry
            .upsert_chunk(StoredChunk {
                session_id: id.clone(),
                chunk_index: 0,
                chunk_hash: calculate_hash(b"abcd"),
                size: 4,
                storage_key: key.clone(),
            })
            .await
            .unwrap();

        // The process died while streaming the staging object.
        let assembly_id = registry.begin_assembly(&id).await.unwrap();
        let session_dir = dir.path().join("uploads").join(&id);
        let torn = session_dir.join(format!(
            "assembly-{}.partial.tmp-{}",
            assembly_id,
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&torn, vec![7u8; 4096]).unwrap();

        let grace = registry.config().completing_grace();
        let report = reaper
            .sweep_at(Utc::now() + grace + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.reverted, 1);
        assert!(!torn.exists());
        assert!(storage.exists(&key).await.unwrap());

        let ttl = registry.config().session_ttl();
        let report = reaper
            .sweep_at(Utc::now() + ttl + grace + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
        assert!(!session_dir.exists());
    }
}
