use crate::config::{StorageBackendKind, UploadConfig};
use crate::services::storage::{
    LocalStorageBackend, MemoryStorageBackend, S3StorageBackend, StorageBackend,
};
use anyhow::Context;
use aws_sdk_s3::config::Region;
use std::env;
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(config: &UploadConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.storage_backend {
        StorageBackendKind::S3 => Ok(Arc::new(setup_s3().await?)),
        StorageBackendKind::Local => {
            info!("💾 Local Storage: {}", config.local_storage_root.display());
            let backend = LocalStorageBackend::new(&config.local_storage_root)
                .await
                .with_context(|| {
                    format!(
                        "cannot open storage root {}",
                        config.local_storage_root.display()
                    )
                })?;
            Ok(Arc::new(backend))
        }
        StorageBackendKind::Memory => {
            tracing::warn!("🧪 In-memory storage selected; uploads will not survive a restart");
            Ok(Arc::new(MemoryStorageBackend::new()))
        }
    }
}

async fn setup_s3() -> anyhow::Result<S3StorageBackend> {
    let endpoint_url = env::var("S3_ENDPOINT").context("S3_ENDPOINT must be set")?;
    let access_key = env::var("S3_ACCESS_KEY").context("S3_ACCESS_KEY must be set")?;
    let secret_key = env::var("S3_SECRET_KEY").context("S3_SECRET_KEY must be set")?;
    let bucket = env::var("S3_BUCKET").context("S3_BUCKET must be set")?;
    let region = env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

    info!("☁️  S3 Storage: {} (Bucket: {})", endpoint_url, bucket);

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new(region))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);

    // Ensure bucket exists
    match s3_client.head_bucket().bucket(&bucket).send().await {
        Ok(_) => info!("✅ Bucket '{}' is ready", bucket),
        Err(_) => {
            info!("🪣 Bucket '{}' not found, creating...", bucket);
            if let Err(e) = s3_client.create_bucket().bucket(&bucket).send().await {
                tracing::error!("❌ Failed to create bucket '{}': {}", bucket, e);
            } else {
                info!("✅ Bucket '{}' created successfully", bucket);
            }
        }
    }

    Ok(S3StorageBackend::new(s3_client, bucket))
}
