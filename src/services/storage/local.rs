//! Local filesystem storage backend.

use super::{BlobReader, StorageBackend, StorageError, StorageResult, validate_key};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Marker for in-progress writes; never reported by listings.
const TEMP_MARKER: &str = ".tmp-";

pub struct LocalStorageBackend {
    root: PathBuf,
}

impl LocalStorageBackend {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Converts an absolute path under the root back to a `/`-separated key.
    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    /// Walks every file under `prefix`, splitting finished objects from
    /// partial writes.
    async fn scan(&self, prefix: &str) -> StorageResult<PrefixScan> {
        // Start the walk at the deepest directory the prefix fully names.
        let start = match prefix.rfind('/') {
            Some(idx) => {
                let dir = &prefix[..idx];
                validate_key(dir)?;
                self.root.join(dir)
            }
            None => self.root.clone(),
        };

        let mut scan = PrefixScan::default();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            scan.dirs.push(dir);

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let Some(key) = self.path_to_key(&path) else {
                        continue;
                    };
                    if !key.starts_with(prefix) {
                        continue;
                    }
                    if is_partial_write(&key) {
                        scan.partial.push(path);
                    } else {
                        scan.files.push(key);
                    }
                }
            }
        }
        Ok(scan)
    }

    /// Removes directories wholly inside `prefix` that are now empty,
    /// deepest first. Never removes the storage root.
    async fn prune_empty_dirs(&self, prefix: &str, mut dirs: Vec<PathBuf>) {
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in dirs {
            if dir == self.root {
                continue;
            }
            let Some(key) = self.path_to_key(&dir) else {
                continue;
            };
            if !format!("{key}/").starts_with(prefix) {
                continue;
            }
            // Fails while anything is left inside, which is fine.
            if let Err(e) = fs::remove_dir(&dir).await {
                tracing::trace!("Keeping directory {}: {}", dir.display(), e);
            }
        }
    }
}

#[derive(Default)]
struct PrefixScan {
    files: Vec<String>,
    partial: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

/// True for the `<name>.tmp-<uuid>` files `put` writes before renaming.
fn is_partial_write(key: &str) -> bool {
    key.rsplit_once(TEMP_MARKER).is_some_and(|(stem, suffix)| {
        !stem.is_empty() && !suffix.contains('/') && Uuid::parse_str(suffix).is_ok()
    })
}

#[async_trait]
impl StorageBackend for LocalStorageBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, reader), fields(backend = "local"))]
    async fn put<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> StorageResult<u64> {
        let path = self.key_path(key)?;
        self.ensure_parent(&path).await?;

        // Write next to the target, then rename over it so readers never see a torn file.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let temp_path = path.with_file_name(format!("{}{}{}", file_name, TEMP_MARKER, Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await?;
            Ok::<u64, std::io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => Ok(written),
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::Io(e))
            }
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn get(&self, key: &str) -> StorageResult<BlobReader> {
        let path = self.key_path(key)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = self.scan(prefix).await?.files;
        keys.sort();
        Ok(keys)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let from_path = self.key_path(from)?;
        let to_path = self.key_path(to)?;
        self.ensure_parent(&to_path).await?;
        fs::rename(&from_path, &to_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(from.to_string())
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn discard_incomplete(&self, prefix: &str) -> StorageResult<usize> {
        let scan = self.scan(prefix).await?;

        let mut removed = 0;
        for path in &scan.partial {
            match fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        if removed > 0 {
            tracing::info!("Removed {} partial writes under {}", removed, prefix);
        }

        self.prune_empty_dirs(prefix, scan.dirs).await;
        Ok(removed)
    }
}
