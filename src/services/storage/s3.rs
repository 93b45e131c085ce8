use super::{BlobReader, StorageBackend, StorageError, StorageResult};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Part size used when streaming a put through multipart upload.
const PART_SIZE: usize = 10 * 1024 * 1024;

/// Largest object S3 will copy in a single CopyObject call.
const MAX_SINGLE_COPY: i64 = 5 * 1024 * 1024 * 1024;

/// Range size for UploadPartCopy when publishing objects above the single copy limit.
const COPY_PART_SIZE: i64 = 512 * 1024 * 1024;

fn s3_err<E: std::error::Error>(e: E) -> StorageError {
    StorageError::S3(DisplayErrorContext(e).to_string())
}

/// Reads until `buffer` is full or the reader is exhausted.
async fn fill_buffer<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buffer.len() {
        let read = reader.read(&mut buffer[n..]).await?;
        if read == 0 {
            break;
        }
        n += read;
    }
    Ok(n)
}

pub struct S3StorageBackend {
    client: Client,
    bucket: String,
}

impl S3StorageBackend {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    async fn upload_parts<'a>(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send + 'a),
        buffer: &mut [u8],
        first_len: usize,
    ) -> StorageResult<u64> {
        let mut part_number = 1;
        let mut completed_parts = Vec::new();
        let mut total_size = 0u64;
        let mut n = first_len;

        while n > 0 {
            total_size += n as u64;
            let upload_part_res = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(part_number)
                .send()
                .await
                .map_err(s3_err)?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(upload_part_res.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );

            part_number += 1;
            n = fill_buffer(reader, buffer).await?;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(s3_err)?;

        Ok(total_size)
    }

    async fn copy_in_parts(&self, from: &str, to: &str, size: i64) -> StorageResult<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(to)
            .send()
            .await
            .map_err(s3_err)?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| StorageError::S3("no upload id returned".to_string()))?
            .to_string();

        let result = async {
            let mut completed_parts = Vec::new();
            let mut offset = 0i64;
            let mut part_number = 1;
            while offset < size {
                let end = (offset + COPY_PART_SIZE).min(size) - 1;
                let res = self
                    .client
                    .upload_part_copy()
                    .bucket(&self.bucket)
                    .key(to)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .copy_source(format!("{}/{}", self.bucket, from))
                    .copy_source_range(format!("bytes={}-{}", offset, end))
                    .send()
                    .await
                    .map_err(s3_err)?;

                let etag = res
                    .copy_part_result()
                    .and_then(|r| r.e_tag())
                    .unwrap_or_default();
                completed_parts.push(
                    CompletedPart::builder()
                        .e_tag(etag)
                        .part_number(part_number)
                        .build(),
                );

                offset = end + 1;
                part_number += 1;
            }

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(to)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed_parts))
                        .build(),
                )
                .send()
                .await
                .map_err(s3_err)?;
            Ok::<(), StorageError>(())
        }
        .await;

        if result.is_err() {
            self.abort_multipart(to, &upload_id).await;
        }
        result
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(
                "Failed to abort multipart upload {} for {}: {}",
                upload_id,
                key,
                DisplayErrorContext(e)
            );
        }
    }

    async fn object_size(&self, key: &str) -> StorageResult<i64> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(res) => Ok(res.content_length().unwrap_or(0)),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Err(StorageError::NotFound(key.to_string()))
                } else {
                    Err(s3_err(service_error))
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for S3StorageBackend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> StorageResult<u64> {
        let mut buffer = vec![0u8; PART_SIZE];
        let first = fill_buffer(&mut reader, &mut buffer).await?;

        // Small objects skip multipart; S3 rejects multipart parts under 5 MB anyway.
        if first < PART_SIZE {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(buffer[..first].to_vec()))
                .send()
                .await
                .map_err(s3_err)?;
            return Ok(first as u64);
        }

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(s3_err)?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| StorageError::S3("no upload id returned".to_string()))?
            .to_string();

        match self
            .upload_parts(key, &upload_id, reader.as_mut(), &mut buffer, first)
            .await
        {
            Ok(total) => Ok(total),
            Err(e) => {
                self.abort_multipart(key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn get(&self, key: &str) -> StorageResult<BlobReader> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(res) => Ok(Box::new(res.body.into_async_read())),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Err(StorageError::NotFound(key.to_string()))
                } else {
                    Err(s3_err(service_error))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(s3_err)?;
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut objects = Vec::new();
        let mut continuation_token = None;

        loop {
            let res = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await
                .map_err(s3_err)?;

            for object in res.contents() {
                if let Some(key) = object.key() {
                    objects.push(key.to_string());
                }
            }

            if res.is_truncated().unwrap_or(false) {
                continuation_token = res.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let size = self.object_size(from).await?;

        if size > MAX_SINGLE_COPY {
            self.copy_in_parts(from, to, size).await?;
        } else {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(format!("{}/{}", self.bucket, from))
                .key(to)
                .send()
                .await
                .map_err(|e| {
                    tracing::error!(
                        "S3 copy_object failed: source={}/{}, dest={}",
                        self.bucket,
                        from,
                        to
                    );
                    s3_err(e)
                })?;
        }

        self.delete(from).await
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.object_size(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Aborts multipart uploads a crashed `put` or `rename` never finished.
    async fn discard_incomplete(&self, prefix: &str) -> StorageResult<usize> {
        let mut aborted = 0;
        let mut key_marker = None;
        let mut upload_id_marker = None;

        loop {
            let res = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_key_marker(key_marker)
                .set_upload_id_marker(upload_id_marker)
                .send()
                .await
                .map_err(s3_err)?;

            for upload in res.uploads() {
                if let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) {
                    self.abort_multipart(key, upload_id).await;
                    aborted += 1;
                }
            }

            if res.is_truncated().unwrap_or(false) {
                key_marker = res.next_key_marker().map(str::to_string);
                upload_id_marker = res.next_upload_id_marker().map(str::to_string);
            } else {
                break;
            }
        }

        if aborted > 0 {
            tracing::info!("Aborted {} unfinished multipart uploads under {}", aborted, prefix);
        }
        Ok(aborted)
    }
}
