use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use resumable_upload::config::UploadConfig;
use resumable_upload::infrastructure::{database, storage};
use resumable_upload::services::upload_service::UploadService;
use resumable_upload::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// HTTP API only
    Api,
    /// Expiry reaper only
    Reaper,
    /// Both in one process
    All,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service to run
    #[arg(short, long, value_enum, default_value_t = Mode::All)]
    mode: Mode,

    /// Port for the API server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Environment & logging
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resumable_upload=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting resumable upload service [Mode: {:?}]...", args.mode);

    // 2. Common infrastructure
    let config = UploadConfig::from_env();
    info!(
        "🛡️  Upload Config: Max Size={}MB, Chunk Size={}..={} bytes, TTL={}s, Backend={:?}",
        config.max_file_size / 1024 / 1024,
        config.min_chunk_size,
        config.max_chunk_size,
        config.session_ttl_secs,
        config.storage_backend
    );

    let db = database::setup_database().await?;
    let storage_backend = storage::setup_storage(&config).await?;

    let upload_service = Arc::new(UploadService::new(
        db.clone(),
        storage_backend,
        config.clone(),
    ));

    // 3. Shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    // 4. Reaper
    if matches!(args.mode, Mode::Reaper | Mode::All) {
        let reaper = upload_service.reaper();
        let reaper_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            reaper.run(reaper_shutdown).await;
        }));
        info!("👷 Expiry reaper initialized.");
    }

    // 5. API
    if matches!(args.mode, Mode::Api | Mode::All) {
        let state = AppState {
            db: db.clone(),
            upload_service: upload_service.clone(),
            config: config.clone(),
        };

        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            );

        let app = create_app(state).layer(trace_layer);
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("✅ API Server listening on: http://0.0.0.0:{}", args.port);
        info!("📖 Swagger UI documentation: http://localhost:{}/swagger-ui", args.port);

        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
            {
                error!("❌ Server runtime error: {}", e);
            }
        }));
    }

    // 6. Wait for a signal, then stop everything
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    info!("🛑 Shutting down upload services...");
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Task ended abnormally: {}", e);
        }
    }

    info!("👋 Exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
