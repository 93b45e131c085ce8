use std::env;
use std::path::PathBuf;

/// Which storage backend holds chunk blobs and final objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    S3,
    Local,
    Memory,
}

impl StorageBackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "s3" | "minio" => Some(Self::S3),
            "local" | "fs" | "filesystem" => Some(Self::Local),
            "memory" | "mem" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Upload engine configuration
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Maximum declared file size in bytes (default: 50 GB)
    pub max_file_size: u64,

    /// Smallest chunk size a session may declare (default: 1 byte)
    pub min_chunk_size: u64,

    /// Largest chunk size a session may declare (default: 64 MB)
    pub max_chunk_size: u64,

    /// Inactivity window; each accepted chunk pushes expiry this far out (default: 24h)
    pub session_ttl_secs: i64,

    /// Seconds between reaper sweeps (default: 60)
    pub reaper_interval_secs: u64,

    /// How long a session may sit in "completing" before the reaper reverts it (default: 15 min)
    pub completing_grace_secs: i64,

    /// How long terminal session rows are kept as tombstones (default: 7 days)
    pub terminal_retention_secs: i64,

    /// Parallel blob deletions during purge (default: 8)
    pub purge_concurrency: usize,

    /// Storage backend: "s3", "local" or "memory" (default: "local")
    pub storage_backend: StorageBackendKind,

    /// Root directory for the local backend (default: "./data")
    pub local_storage_root: PathBuf,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024 * 1024, // 50 GB
            min_chunk_size: 1,
            max_chunk_size: 64 * 1024 * 1024, // 64 MB
            session_ttl_secs: 24 * 60 * 60,
            reaper_interval_secs: 60,
            completing_grace_secs: 15 * 60,
            terminal_retention_secs: 7 * 24 * 60 * 60,
            purge_concurrency: 8,
            storage_backend: StorageBackendKind::Local,
            local_storage_root: PathBuf::from("./data"),
        }
    }
}

impl UploadConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            min_chunk_size: env::var("MIN_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.min_chunk_size),

            max_chunk_size: env::var("MAX_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_chunk_size),

            session_ttl_secs: env::var("SESSION_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.session_ttl_secs),

            reaper_interval_secs: env::var("REAPER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.reaper_interval_secs),

            completing_grace_secs: env::var("COMPLETING_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.completing_grace_secs),

            terminal_retention_secs: env::var("TERMINAL_RETENTION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.terminal_retention_secs),

            purge_concurrency: env::var("PURGE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.purge_concurrency),

            storage_backend: env::var("STORAGE_BACKEND")
                .ok()
                .and_then(|v| StorageBackendKind::parse(&v))
                .unwrap_or(default.storage_backend),

            local_storage_root: env::var("LOCAL_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.local_storage_root),
        }
    }

    /// Create config for development (in-memory storage, short timers)
    pub fn development() -> Self {
        Self {
            session_ttl_secs: 60 * 60,
            reaper_interval_secs: 10,
            completing_grace_secs: 60,
            terminal_retention_secs: 24 * 60 * 60,
            storage_backend: StorageBackendKind::Memory,
            ..Self::default()
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs)
    }

    pub fn completing_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.completing_grace_secs)
    }

    pub fn terminal_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.terminal_retention_secs)
    }
}
