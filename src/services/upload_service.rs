use crate::config::UploadConfig;
use crate::models::{ChunkReceipt, FinalObjectRef, SessionStatusReport, UploadSession};
use crate::services::assembly::AssemblyCoordinator;
use crate::services::chunk_receiver::ChunkReceiver;
use crate::services::error::UploadResult;
use crate::services::lifecycle::UploadLifecycle;
use crate::services::reaper::ExpiryReaper;
use crate::services::session_registry::{NewSession, SessionRegistry};
use crate::services::storage::StorageBackend;
use bytes::Bytes;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

/// Entry point for everything the HTTP layer (or any other caller) needs.
pub struct UploadService {
    registry: SessionRegistry,
    storage: Arc<dyn StorageBackend>,
    receiver: ChunkReceiver,
    coordinator: AssemblyCoordinator,
    lifecycle: UploadLifecycle,
}

impl UploadService {
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn StorageBackend>,
        config: UploadConfig,
    ) -> Self {
        let registry = SessionRegistry::new(db, config);
        let lifecycle = UploadLifecycle::new(registry.clone(), storage.clone());
        Self {
            receiver: ChunkReceiver::new(registry.clone(), storage.clone()),
            coordinator: AssemblyCoordinator::new(
                registry.clone(),
                storage.clone(),
                lifecycle.clone(),
            ),
            lifecycle,
            registry,
            storage,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        self.registry.config()
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// A reaper sharing this service's registry and storage.
    pub fn reaper(&self) -> ExpiryReaper {
        ExpiryReaper::new(self.registry.clone(), self.storage.clone())
    }

    pub async fn create_session(&self, req: NewSession) -> UploadResult<UploadSession> {
        self.registry.create_session(req).await
    }

    pub async fn get_session(&self, session_id: &str) -> UploadResult<UploadSession> {
        self.registry.get_session(session_id).await
    }

    pub async fn put_chunk(
        &self,
        session_id: &str,
        chunk_index: i64,
        data: Bytes,
        chunk_hash: &str,
    ) -> UploadResult<ChunkReceipt> {
        self.receiver
            .put_chunk(session_id, chunk_index, data, chunk_hash)
            .await
    }

    pub async fn complete(&self, session_id: &str) -> UploadResult<FinalObjectRef> {
        self.coordinator.complete(session_id).await
    }

    pub async fn abort(&self, session_id: &str) -> UploadResult<()> {
        self.lifecycle.abort(session_id).await
    }

    pub async fn status(&self, session_id: &str) -> UploadResult<SessionStatusReport> {
        self.lifecycle.status(session_id).await
    }

    pub async fn list_open_sessions(&self) -> UploadResult<Vec<UploadSession>> {
        self.registry.list_open_sessions().await
    }
}
