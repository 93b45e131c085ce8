use crate::config::UploadConfig;
use crate::entities::{prelude::*, *};
use crate::models::{ChunkStatus, SessionStatus, UploadSession};
use crate::services::error::{UploadError, UploadResult};
use crate::utils::hash::is_sha256_hex;
use crate::utils::validation::sanitize_file_name;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use uuid::Uuid;

/// Upper bound on rows pulled per reaper query.
const SWEEP_BATCH: u64 = 100;

pub(crate) fn now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

fn to_session(model: upload_sessions::Model) -> UploadResult<UploadSession> {
    UploadSession::try_from(model).map_err(|e| UploadError::Database(DbErr::Custom(e)))
}

fn terminal_statuses() -> Vec<&'static str> {
    SessionStatus::TERMINAL.iter().map(|s| s.as_str()).collect()
}

/// Parameters for a new upload session, as received from the client.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub file_name: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub content_hash: String,
}

/// A chunk that passed validation and whose bytes are already in storage.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub session_id: String,
    pub chunk_index: u32,
    pub chunk_hash: String,
    pub size: u64,
    pub storage_key: String,
}

/// Durable record of upload sessions and their chunk inventory.
///
/// Every status change goes through a conditional UPDATE on the current
/// status, so concurrent completions, aborts and reaper sweeps can race
/// safely across processes without holding a lock.
#[derive(Clone)]
pub struct SessionRegistry {
    db: DatabaseConnection,
    config: UploadConfig,
}

impl SessionRegistry {
    pub fn new(db: DatabaseConnection, config: UploadConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub async fn create_session(&self, req: NewSession) -> UploadResult<UploadSession> {
        if req.total_size <= 0 {
            return Err(UploadError::InvalidSize(format!(
                "total_size must be positive, got {}",
                req.total_size
            )));
        }
        if req.chunk_size <= 0 {
            return Err(UploadError::InvalidSize(format!(
                "chunk_size must be positive, got {}",
                req.chunk_size
            )));
        }

        let total_size = req.total_size as u64;
        let chunk_size = req.chunk_size as u64;

        if total_size > self.config.max_file_size {
            return Err(UploadError::InvalidSize(format!(
                "total_size {} exceeds maximum of {} bytes",
                total_size, self.config.max_file_size
            )));
        }
        if chunk_size < self.config.min_chunk_size || chunk_size > self.config.max_chunk_size {
            return Err(UploadError::InvalidSize(format!(
                "chunk_size {} outside allowed range {}..={}",
                chunk_size, self.config.min_chunk_size, self.config.max_chunk_size
            )));
        }

        let total_chunks = i32::try_from(total_size.div_ceil(chunk_size)).map_err(|_| {
            UploadError::InvalidSize(format!(
                "{} bytes in {} byte chunks needs too many chunks",
                total_size, chunk_size
            ))
        })?;

        let file_name =
            sanitize_file_name(&req.file_name).map_err(|e| UploadError::InvalidRequest(e.to_string()))?;
        if !is_sha256_hex(&req.content_hash) {
            return Err(UploadError::InvalidRequest(
                "content_hash must be a hex-encoded SHA-256 digest".to_string(),
            ));
        }

        let now = now();
        let session = upload_sessions::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            file_name: Set(file_name),
            total_size: Set(req.total_size),
            chunk_size: Set(req.chunk_size),
            total_chunks: Set(total_chunks),
            content_hash: Set(req.content_hash.to_lowercase()),
            status: Set(SessionStatus::Open.as_str().to_string()),
            final_key: Set(None),
            assembly_id: Set(None),
            created_at: Set(now),
            last_activity_at: Set(now),
            expires_at: Set(now + self.config.session_ttl()),
            updated_at: Set(now),
        };

        let saved = session.insert(&self.db).await?;
        tracing::info!(
            "Created upload session {} for '{}' ({} bytes, {} chunks of {})",
            saved.id,
            saved.file_name,
            saved.total_size,
            saved.total_chunks,
            saved.chunk_size
        );
        to_session(saved)
    }

    /// Loads a session in any state, including terminal tombstones.
    pub async fn find_session(&self, session_id: &str) -> UploadResult<UploadSession> {
        let model = UploadSessions::find_by_id(session_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| UploadError::NotFound(session_id.to_string()))?;
        to_session(model)
    }

    /// Loads a session that can still be acted on.
    pub async fn get_session(&self, session_id: &str) -> UploadResult<UploadSession> {
        let session = self.find_session(session_id).await?;
        match session.status {
            SessionStatus::Expired | SessionStatus::Aborted => {
                Err(UploadError::Expired(session_id.to_string()))
            }
            _ => Ok(session),
        }
    }

    /// Records client activity and pushes expiry out by one inactivity window.
    pub async fn touch(&self, session_id: &str) -> UploadResult<()> {
        let now = now();
        let res = UploadSessions::update_many()
            .col_expr(upload_sessions::Column::LastActivityAt, Expr::value(now))
            .col_expr(
                upload_sessions::Column::ExpiresAt,
                Expr::value(now + self.config.session_ttl()),
            )
            .filter(upload_sessions::Column::Id.eq(session_id))
            .filter(upload_sessions::Column::Status.is_in([
                SessionStatus::Open.as_str(),
                SessionStatus::Completing.as_str(),
            ]))
            .exec(&self.db)
            .await?;

        if res.rows_affected == 0 {
            tracing::debug!("touch on session {} matched no live session", session_id);
        }
        Ok(())
    }

    /// Atomic compare-and-set on the session status.
    pub async fn transition(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> UploadResult<()> {
        if !from.can_transition_to(to) {
            return Err(UploadError::InvalidRequest(format!(
                "illegal status transition {} -> {}",
                from, to
            )));
        }

        let res = UploadSessions::update_many()
            .col_expr(upload_sessions::Column::Status, Expr::value(to.as_str()))
            .col_expr(upload_sessions::Column::AssemblyId, Expr::value(None::<String>))
            .col_expr(upload_sessions::Column::UpdatedAt, Expr::value(now()))
            .filter(upload_sessions::Column::Id.eq(session_id))
            .filter(upload_sessions::Column::Status.eq(from.as_str()))
            .exec(&self.db)
            .await?;

        if res.rows_affected == 1 {
            tracing::info!("Session {} transitioned {} -> {}", session_id, from, to);
            return Ok(());
        }

        let current = self.find_session(session_id).await?;
        Err(UploadError::Conflict {
            expected: from,
            actual: current.status,
        })
    }

    /// Open -> Completing. Returns the fencing token that the caller must
    /// present to leave the "completing" state again.
    pub async fn begin_assembly(&self, session_id: &str) -> UploadResult<String> {
        let assembly_id = Uuid::new_v4().simple().to_string();
        let res = UploadSessions::update_many()
            .col_expr(
                upload_sessions::Column::Status,
                Expr::value(SessionStatus::Completing.as_str()),
            )
            .col_expr(upload_sessions::Column::AssemblyId, Expr::value(assembly_id.clone()))
            .col_expr(upload_sessions::Column::UpdatedAt, Expr::value(now()))
            .filter(upload_sessions::Column::Id.eq(session_id))
            .filter(upload_sessions::Column::Status.eq(SessionStatus::Open.as_str()))
            .exec(&self.db)
            .await?;

        if res.rows_affected == 1 {
            tracing::info!("Session {} entered assembly {}", session_id, assembly_id);
            return Ok(assembly_id);
        }

        let current = self.find_session(session_id).await?;
        Err(UploadError::Conflict {
            expected: SessionStatus::Open,
            actual: current.status,
        })
    }

    /// Completing -> Committed, recording where the object was published.
    /// Only the assembly attempt holding `assembly_id` may commit.
    pub async fn commit(
        &self,
        session_id: &str,
        assembly_id: &str,
        final_key: &str,
    ) -> UploadResult<()> {
        let res = UploadSessions::update_many()
            .col_expr(
                upload_sessions::Column::Status,
                Expr::value(SessionStatus::Committed.as_str()),
            )
            .col_expr(upload_sessions::Column::FinalKey, Expr::value(final_key))
            .col_expr(upload_sessions::Column::AssemblyId, Expr::value(None::<String>))
            .col_expr(upload_sessions::Column::UpdatedAt, Expr::value(now()))
            .filter(upload_sessions::Column::Id.eq(session_id))
            .filter(upload_sessions::Column::Status.eq(SessionStatus::Completing.as_str()))
            .filter(upload_sessions::Column::AssemblyId.eq(assembly_id))
            .exec(&self.db)
            .await?;

        if res.rows_affected == 1 {
            tracing::info!("Session {} committed at {}", session_id, final_key);
            return Ok(());
        }

        let current = self.find_session(session_id).await?;
        Err(UploadError::Conflict {
            expected: SessionStatus::Completing,
            actual: current.status,
        })
    }

    /// Completing -> Open after a failed assembly. A no-op (returns false)
    /// when the attempt no longer owns the session.
    pub async fn release_assembly(&self, session_id: &str, assembly_id: &str) -> UploadResult<bool> {
        self.reopen(session_id, Some(assembly_id), None).await
    }

    /// Completing -> Open for an assembly that has not moved since `cutoff`.
    /// Both the token and the staleness are re-checked in the same update, so
    /// an attempt that released and was replaced after the caller looked is
    /// left alone (returns false).
    pub async fn reclaim_stalled_assembly(
        &self,
        session_id: &str,
        assembly_id: Option<&str>,
        cutoff: DateTime<FixedOffset>,
    ) -> UploadResult<bool> {
        self.reopen(session_id, assembly_id, Some(cutoff)).await
    }

    async fn reopen(
        &self,
        session_id: &str,
        assembly_id: Option<&str>,
        stalled_before: Option<DateTime<FixedOffset>>,
    ) -> UploadResult<bool> {
        let now = now();
        let mut update = UploadSessions::update_many()
            .col_expr(
                upload_sessions::Column::Status,
                Expr::value(SessionStatus::Open.as_str()),
            )
            .col_expr(upload_sessions::Column::AssemblyId, Expr::value(None::<String>))
            .col_expr(upload_sessions::Column::LastActivityAt, Expr::value(now))
            .col_expr(
                upload_sessions::Column::ExpiresAt,
                Expr::value(now + self.config.session_ttl()),
            )
            .col_expr(upload_sessions::Column::UpdatedAt, Expr::value(now))
            .filter(upload_sessions::Column::Id.eq(session_id))
            .filter(upload_sessions::Column::Status.eq(SessionStatus::Completing.as_str()));
        update = match assembly_id {
            Some(token) => update.filter(upload_sessions::Column::AssemblyId.eq(token)),
            None => update.filter(upload_sessions::Column::AssemblyId.is_null()),
        };
        if let Some(cutoff) = stalled_before {
            update = update.filter(upload_sessions::Column::UpdatedAt.lt(cutoff));
        }

        let res = update.exec(&self.db).await?;
        Ok(res.rows_affected == 1)
    }

    /// Inserts or replaces the record for one chunk slot. Last write wins.
    pub async fn upsert_chunk(&self, chunk: StoredChunk) -> UploadResult<()> {
        let record = upload_chunks::ActiveModel {
            session_id: Set(chunk.session_id),
            chunk_index: Set(chunk.chunk_index as i32),
            chunk_hash: Set(chunk.chunk_hash),
            size: Set(chunk.size as i64),
            status: Set(ChunkStatus::Stored.as_str().to_string()),
            storage_key: Set(chunk.storage_key),
            stored_at: Set(now()),
        };

        UploadChunks::insert(record)
            .on_conflict(
                OnConflict::columns([
                    upload_chunks::Column::SessionId,
                    upload_chunks::Column::ChunkIndex,
                ])
                .update_columns([
                    upload_chunks::Column::ChunkHash,
                    upload_chunks::Column::Size,
                    upload_chunks::Column::Status,
                    upload_chunks::Column::StorageKey,
                    upload_chunks::Column::StoredAt,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    /// Notes a failed attempt for a slot that has nothing stored yet. An
    /// existing record, stored or rejected, is left untouched.
    pub async fn record_rejection(
        &self,
        session_id: &str,
        chunk_index: u32,
        chunk_hash: &str,
        size: u64,
        storage_key: &str,
    ) -> UploadResult<()> {
        let record = upload_chunks::ActiveModel {
            session_id: Set(session_id.to_string()),
            chunk_index: Set(chunk_index as i32),
            chunk_hash: Set(chunk_hash.to_string()),
            size: Set(size as i64),
            status: Set(ChunkStatus::Rejected.as_str().to_string()),
            storage_key: Set(storage_key.to_string()),
            stored_at: Set(now()),
        };

        let res = UploadChunks::insert(record)
            .on_conflict(
                OnConflict::columns([
                    upload_chunks::Column::SessionId,
                    upload_chunks::Column::ChunkIndex,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await;

        match res {
            Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Flags stored chunks whose bytes no longer match their recorded hash.
    pub async fn mark_rejected(&self, session_id: &str, indices: &[u32]) -> UploadResult<u64> {
        if indices.is_empty() {
            return Ok(0);
        }
        let res = UploadChunks::update_many()
            .col_expr(
                upload_chunks::Column::Status,
                Expr::value(ChunkStatus::Rejected.as_str()),
            )
            .filter(upload_chunks::Column::SessionId.eq(session_id))
            .filter(upload_chunks::Column::ChunkIndex.is_in(indices.iter().map(|i| *i as i32)))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    /// All chunk records of a session, ordered by index.
    pub async fn list_chunks(&self, session_id: &str) -> UploadResult<Vec<upload_chunks::Model>> {
        Ok(UploadChunks::find()
            .filter(upload_chunks::Column::SessionId.eq(session_id))
            .order_by_asc(upload_chunks::Column::ChunkIndex)
            .all(&self.db)
            .await?)
    }

    pub async fn delete_chunks(&self, session_id: &str) -> UploadResult<u64> {
        let res = UploadChunks::delete_many()
            .filter(upload_chunks::Column::SessionId.eq(session_id))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn list_open_sessions(&self) -> UploadResult<Vec<UploadSession>> {
        UploadSessions::find()
            .filter(upload_sessions::Column::Status.eq(SessionStatus::Open.as_str()))
            .order_by_asc(upload_sessions::Column::CreatedAt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(to_session)
            .collect()
    }

    /// Live sessions whose inactivity window has run out.
    pub async fn expired_sessions(
        &self,
        now: DateTime<FixedOffset>,
    ) -> UploadResult<Vec<UploadSession>> {
        UploadSessions::find()
            .filter(upload_sessions::Column::Status.is_in([
                SessionStatus::Open.as_str(),
                SessionStatus::Completing.as_str(),
            ]))
            .filter(upload_sessions::Column::ExpiresAt.lt(now))
            .limit(SWEEP_BATCH)
            .all(&self.db)
            .await?
            .into_iter()
            .map(to_session)
            .collect()
    }

    /// Assemblies that entered "completing" before `cutoff` and never left it.
    pub async fn stalled_completions(
        &self,
        cutoff: DateTime<FixedOffset>,
    ) -> UploadResult<Vec<UploadSession>> {
        UploadSessions::find()
            .filter(upload_sessions::Column::Status.eq(SessionStatus::Completing.as_str()))
            .filter(upload_sessions::Column::UpdatedAt.lt(cutoff))
            .limit(SWEEP_BATCH)
            .all(&self.db)
            .await?
            .into_iter()
            .map(to_session)
            .collect()
    }

    /// Terminal sessions that still own chunk records, i.e. an earlier purge failed.
    pub async fn terminal_sessions_with_chunks(&self) -> UploadResult<Vec<UploadSession>> {
        UploadSessions::find()
            .filter(upload_sessions::Column::Status.is_in(terminal_statuses()))
            .filter(
                upload_sessions::Column::Id.in_subquery(
                    Query::select()
                        .column(upload_chunks::Column::SessionId)
                        .from(UploadChunks)
                        .to_owned(),
                ),
            )
            .limit(SWEEP_BATCH)
            .all(&self.db)
            .await?
            .into_iter()
            .map(to_session)
            .collect()
    }

    /// Drops terminal tombstones last changed before `cutoff`. Sessions that
    /// still own chunk records are kept until those are purged.
    pub async fn delete_terminal_sessions_before(
        &self,
        cutoff: DateTime<FixedOffset>,
    ) -> UploadResult<u64> {
        let res = UploadSessions::delete_many()
            .filter(upload_sessions::Column::Status.is_in(terminal_statuses()))
            .filter(upload_sessions::Column::UpdatedAt.lt(cutoff))
            .filter(
                upload_sessions::Column::Id.not_in_subquery(
                    Query::select()
                        .column(upload_chunks::Column::SessionId)
                        .from(UploadChunks)
                        .to_owned(),
                ),
            )
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database;
    use crate::utils::hash::calculate_hash;
    use sea_orm::Database;

    async fn registry() -> SessionRegistry {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        database::run_migrations(&db).await.unwrap();
        SessionRegistry::new(db, UploadConfig::development())
    }

    fn new_session(total_size: i64, chunk_size: i64) -> NewSession {
        NewSession {
            file_name: "archive.tar".to_string(),
            total_size,
            chunk_size,
            content_hash: calculate_hash(b"whatever"),
        }
    }

    #[tokio::test]
    async fn test_create_session_computes_total_chunks() {
        let registry = registry().await;
        let session = registry
            .create_session(new_session(3_000_000, 1_000_000))
            .await
            .unwrap();
        assert_eq!(session.total_chunks, 3);
        assert_eq!(session.status, SessionStatus::Open);

        let session = registry
            .create_session(new_session(3_000_001, 1_000_000))
            .await
            .unwrap();
        assert_eq!(session.total_chunks, 4);
        assert!(session.expires_at > session.created_at);
    }

    #[tokio::test]
    async fn test_create_session_rejects_non_positive_sizes() {
        let registry = registry().await;
        for (total, chunk) in [(0, 10), (-5, 10), (10, 0), (10, -1)] {
            let err = registry
                .create_session(new_session(total, chunk))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidSize(_)), "{total}/{chunk}");
        }
    }

    #[tokio::test]
    async fn test_create_session_rejects_bad_hash() {
        let registry = registry().await;
        let mut req = new_session(10, 10);
        req.content_hash = "not-a-hash".to_string();
        let err = registry.create_session(req).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let registry = registry().await;
        let session = registry.create_session(new_session(10, 5)).await.unwrap();
        let id = session.session_id.as_str();

        registry
            .transition(id, SessionStatus::Open, SessionStatus::Completing)
            .await
            .unwrap();

        let err = registry
            .transition(id, SessionStatus::Open, SessionStatus::Completing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::Conflict {
                expected: SessionStatus::Open,
                actual: SessionStatus::Completing
            }
        ));

        let err = registry
            .transition("missing", SessionStatus::Open, SessionStatus::Completing)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_assembly_token_fences_stale_attempts() {
        let registry = registry().await;
        let session = registry.create_session(new_session(10, 5)).await.unwrap();
        let id = session.session_id.as_str();

        let stale = registry.begin_assembly(id).await.unwrap();
        // Reaper reverts the stalled attempt, a new one takes over.
        registry
            .transition(id, SessionStatus::Completing, SessionStatus::Open)
            .await
            .unwrap();
        let fresh = registry.begin_assembly(id).await.unwrap();
        assert_ne!(stale, fresh);

        assert!(!registry.release_assembly(id, &stale).await.unwrap());
        let err = registry.commit(id, &stale, "objects/x").await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Conflict {
                actual: SessionStatus::Completing,
                ..
            }
        ));

        registry.commit(id, &fresh, "objects/x").await.unwrap();
        let committed = registry.find_session(id).await.unwrap();
        assert_eq!(committed.status, SessionStatus::Committed);
        assert_eq!(committed.final_key.as_deref(), Some("objects/x"));
        assert_eq!(committed.assembly_id, None);
    }

    #[tokio::test]
    async fn test_release_assembly_reopens_session() {
        let registry = registry().await;
        let session = registry.create_session(new_session(10, 5)).await.unwrap();
        let id = session.session_id.as_str();

        let token = registry.begin_assembly(id).await.unwrap();
        assert!(registry.release_assembly(id, &token).await.unwrap());
        assert_eq!(
            registry.find_session(id).await.unwrap().status,
            SessionStatus::Open
        );
    }

    #[tokio::test]
    async fn test_reclaim_skips_attempt_replaced_after_snapshot() {
        let registry = registry().await;
        let session = registry.create_session(new_session(10, 5)).await.unwrap();
        let id = session.session_id.as_str();

        // A sweep snapshots the session while the first attempt holds it.
        let stale = registry.begin_assembly(id).await.unwrap();
        let snapshot = registry.find_session(id).await.unwrap();
        assert_eq!(snapshot.assembly_id.as_deref(), Some(stale.as_str()));

        // The attempt gives up and a fresh one starts before the sweep acts.
        assert!(registry.release_assembly(id, &stale).await.unwrap());
        let live = registry.begin_assembly(id).await.unwrap();

        let far_future = (Utc::now() + chrono::Duration::days(1)).fixed_offset();
        assert!(
            !registry
                .reclaim_stalled_assembly(id, snapshot.assembly_id.as_deref(), far_future)
                .await
                .unwrap()
        );
        let current = registry.find_session(id).await.unwrap();
        assert_eq!(current.status, SessionStatus::Completing);
        assert_eq!(current.assembly_id.as_deref(), Some(live.as_str()));

        // The live token alone is not enough while the attempt is fresh.
        let past = (Utc::now() - chrono::Duration::seconds(60)).fixed_offset();
        assert!(
            !registry
                .reclaim_stalled_assembly(id, Some(&live), past)
                .await
                .unwrap()
        );

        assert!(
            registry
                .reclaim_stalled_assembly(id, Some(&live), far_future)
                .await
                .unwrap()
        );
        let reopened = registry.find_session(id).await.unwrap();
        assert_eq!(reopened.status, SessionStatus::Open);
        assert!(reopened.assembly_id.is_none());
    }

    #[tokio::test]
    async fn test_get_session_reports_expired() {
        let registry = registry().await;
        let session = registry.create_session(new_session(10, 5)).await.unwrap();
        let id = session.session_id.as_str();

        registry
            .transition(id, SessionStatus::Open, SessionStatus::Expired)
            .await
            .unwrap();

        assert!(matches!(
            registry.get_session(id).await.unwrap_err(),
            UploadError::Expired(_)
        ));
        assert_eq!(
            registry.find_session(id).await.unwrap().status,
            SessionStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_upsert_chunk_keeps_one_record_per_index() {
        let registry = registry().await;
        let session = registry.create_session(new_session(10, 5)).await.unwrap();
        let id = session.session_id.clone();

        for hash in ["a", "b", "c"] {
            registry
                .upsert_chunk(StoredChunk {
                    session_id: id.clone(),
                    chunk_index: 1,
                    chunk_hash: hash.to_string(),
                    size: 5,
                    storage_key: "k".to_string(),
                })
                .await
                .unwrap();
        }

        let chunks = registry.list_chunks(&id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_hash, "c");
    }

    #[tokio::test]
    async fn test_rejection_never_overwrites_stored_chunk() {
        let registry = registry().await;
        let session = registry.create_session(new_session(10, 5)).await.unwrap();
        let id = session.session_id.clone();

        registry
            .upsert_chunk(StoredChunk {
                session_id: id.clone(),
                chunk_index: 0,
                chunk_hash: "good".to_string(),
                size: 5,
                storage_key: "k0".to_string(),
            })
            .await
            .unwrap();
        registry
            .record_rejection(&id, 0, "bad", 5, "k0")
            .await
            .unwrap();
        registry
            .record_rejection(&id, 1, "bad", 5, "k1")
            .await
            .unwrap();

        let chunks = registry.list_chunks(&id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].status, "stored");
        assert_eq!(chunks[0].chunk_hash, "good");
        assert_eq!(chunks[1].status, "rejected");
    }
}
