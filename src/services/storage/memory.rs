use super::{BlobReader, StorageBackend, StorageError, StorageResult, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Process-local blob store. Contents vanish with the process, so this is
/// only suitable for development and tests.
#[derive(Default)]
pub struct MemoryStorageBackend {
    objects: DashMap<String, Bytes>,
}

impl MemoryStorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorageBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> StorageResult<u64> {
        validate_key(key)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let size = data.len() as u64;
        self.objects.insert(key.to_string(), Bytes::from(data));
        Ok(size)
    }

    async fn get(&self, key: &str) -> StorageResult<BlobReader> {
        validate_key(key)?;
        let data = self
            .objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        validate_key(from)?;
        validate_key(to)?;
        let (_, data) = self
            .objects
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        self.objects.insert(to.to_string(), data);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.objects.contains_key(key))
    }
}
