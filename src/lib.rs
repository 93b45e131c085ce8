pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::api::handlers;
use crate::config::UploadConfig;
use crate::services::upload_service::UploadService;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{delete, get, post, put},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Slack on top of the largest chunk for framing overhead.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::uploads::create_upload,
        handlers::uploads::list_uploads,
        handlers::uploads::put_chunk,
        handlers::uploads::complete_upload,
        handlers::uploads::upload_status,
        handlers::uploads::abort_upload,
        handlers::health::health_check,
    ),
    components(
        schemas(
            handlers::uploads::CreateUploadRequest,
            handlers::uploads::CreateUploadResponse,
            handlers::uploads::OpenSessionSummary,
            handlers::health::HealthResponse,
            models::SessionStatus,
            models::ChunkReceipt,
            models::FinalObjectRef,
            models::SessionStatusReport,
        )
    ),
    tags(
        (name = "uploads", description = "Resumable chunked upload endpoints"),
        (name = "system", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub upload_service: Arc<UploadService>,
    pub config: UploadConfig,
}

pub fn create_app(state: AppState) -> Router {
    let chunk_limit = usize::try_from(state.config.max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(handlers::health::health_check))
        .route(
            "/uploads",
            post(handlers::uploads::create_upload).get(handlers::uploads::list_uploads),
        )
        .route(
            "/uploads/:session_id",
            delete(handlers::uploads::abort_upload),
        )
        .route(
            "/uploads/:session_id/chunks/:index",
            put(handlers::uploads::put_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route(
            "/uploads/:session_id/complete",
            post(handlers::uploads::complete_upload),
        )
        .route(
            "/uploads/:session_id/status",
            get(handlers::uploads::upload_status),
        )
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .with_state(state)
}
