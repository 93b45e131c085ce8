use crate::entities::{upload_chunks, upload_sessions};
use anyhow::Context;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, Schema,
};
use std::env;
use std::time::Duration;
use tracing::info;

pub async fn setup_database() -> anyhow::Result<DatabaseConnection> {
    let db_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    info!("📂 Database: {}", db_url);

    let mut opt = ConnectOptions::new(&db_url);
    opt.max_connections(100)
        .min_connections(5)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    info!("✅ Database connected successfully");

    run_migrations(&db).await?;

    Ok(db)
}

pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();

    if builder == DatabaseBackend::Postgres {
        info!("🔄 Running SQLx migrations for PostgreSQL...");
        let pool = db.get_postgres_connection_pool();
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("PostgreSQL migration failed")?;
        return Ok(());
    }

    info!("🔄 Running SeaORM auto-migrations for SQLite/Other...");
    let schema = Schema::new(builder);

    // Order matters for foreign keys: sessions before chunks
    let stmts = vec![
        (
            "upload_sessions",
            schema
                .create_table_from_entity(upload_sessions::Entity)
                .if_not_exists()
                .to_owned(),
        ),
        (
            "upload_chunks",
            schema
                .create_table_from_entity(upload_chunks::Entity)
                .if_not_exists()
                .to_owned(),
        ),
    ];

    for (name, stmt) in stmts {
        db.execute(builder.build(&stmt))
            .await
            .with_context(|| format!("failed to create table '{}'", name))?;
        info!("   - Table '{}' checked/created", name);
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_upload_sessions_status_expires ON upload_sessions(status, expires_at)",
        "CREATE INDEX IF NOT EXISTS idx_upload_sessions_status_updated ON upload_sessions(status, updated_at)",
    ];
    for query in indexes {
        if let Err(e) = db
            .execute(sea_orm::Statement::from_string(builder, query.to_string()))
            .await
        {
            tracing::warn!("   - Index creation warning: {} -> {}", query, e);
        }
    }

    Ok(())
}
