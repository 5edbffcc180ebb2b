//! S3 storage backend implementation using the AWS SDK
//!
//! The remote connection may drop credentials mid-write, so `put` keeps the
//! whole body in memory: the declared hash is verified before the first PUT
//! (nothing partial is ever written remotely) and a credential or transport
//! failure can be retried once without rewinding the caller's reader.

use super::traits::{Backend, BlobInfo, BlobRead, StorageError};
use crate::config::BackendConfig;
use crate::hash;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};
use sha2::Digest;
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument, warn};

/// S3 storage backend for content-addressed blobs
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Create a new S3 backend from configuration
    pub async fn new(config: &BackendConfig) -> Result<Self, StorageError> {
        let (endpoint, bucket, region, force_path_style, access_key_id, secret_access_key) =
            match config {
                BackendConfig::S3 {
                    endpoint,
                    bucket,
                    region,
                    force_path_style,
                    access_key_id,
                    secret_access_key,
                } => (
                    endpoint.clone(),
                    bucket.clone(),
                    region.clone(),
                    *force_path_style,
                    access_key_id.clone(),
                    secret_access_key.clone(),
                ),
                _ => {
                    return Err(StorageError::Other(
                        "S3Backend requires S3 configuration".to_string(),
                    ))
                }
            };

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .force_path_style(force_path_style);

        // Custom endpoint for MinIO, LocalStack, etc.
        if let Some(ref ep) = endpoint {
            builder = builder.endpoint_url(ep);
        }

        // Use explicit credentials if provided, otherwise rely on env/instance credentials
        if let (Some(ref key_id), Some(ref secret)) = (access_key_id, secret_access_key) {
            let credentials = Credentials::new(key_id, secret, None, None, "blobstore-config");
            builder = builder.credentials_provider(credentials);
        }

        let client = Client::from_conf(builder.build());

        debug!("S3Backend initialized for bucket: {}", bucket);

        Ok(Self { client, bucket })
    }

    async fn head(&self, name: &str) -> Result<Option<u64>, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
        {
            Ok(head) => Ok(Some(head.content_length.unwrap_or(0).max(0) as u64)),
            Err(e) => {
                if let SdkError::ServiceError(service_error) = &e {
                    if matches!(service_error.err(), HeadObjectError::NotFound(_)) {
                        return Ok(None);
                    }
                }
                Err(StorageError::S3(format!("head_object failed: {}", e)))
            }
        }
    }
}

/// Whether a failed PUT is worth one more attempt: transport trouble, or a
/// credentials refresh surfacing as 401/403 mid-stream.
fn put_is_retryable(err: &SdkError<PutObjectError>) -> bool {
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            status == 401 || status == 403
        }
        _ => false,
    }
}

#[async_trait]
impl Backend for S3Backend {
    #[instrument(skip(self, reader))]
    async fn put(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        hash: &str,
    ) -> Result<(), StorageError> {
        let mut hasher = hash::new_hasher();
        let mut body = Vec::with_capacity(size.min(64 * 1024 * 1024) as usize);
        let mut buf = vec![0u8; hash::COPY_BUF_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want_len = buf.len().min(remaining as usize);
            let n = reader.read(&mut buf[..want_len]).await?;
            if n == 0 {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("blob body ended {} bytes early", remaining),
                )));
            }
            hasher.update(&buf[..n]);
            body.extend_from_slice(&buf[..n]);
            remaining -= n as u64;
        }

        let got = hash::hex_digest(hasher);
        if got != hash {
            return Err(StorageError::HashMismatch {
                name: hash.to_string(),
                got,
            });
        }

        let body = Bytes::from(body);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(name)
                .body(ByteStream::from(body.clone()))
                .send()
                .await;
            match result {
                Ok(_) => break,
                Err(e) if attempts == 1 && put_is_retryable(&e) => {
                    warn!("S3 PUT {} failed ({}), retrying once", name, e);
                }
                Err(e) => return Err(StorageError::S3(format!("put_object failed: {}", e))),
            }
        }

        debug!("S3 PUT {} ({} bytes)", name, size);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<(Box<dyn BlobRead>, u64), StorageError> {
        let Some(size) = self.head(name).await? else {
            return Err(StorageError::NotFound(name.to_string()));
        };
        debug!("S3 GET {} ({} bytes)", name, size);
        let reader = S3BlobRead {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: name.to_string(),
            size,
            pos: 0,
            stream: None,
            chunk: Bytes::new(),
        };
        Ok((Box::new(reader), size))
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        // S3 DeleteObject succeeds for absent keys, so probe first to honor
        // the NotFound contract.
        if self.head(name).await?.is_none() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("delete_object failed: {}", e)))?;

        debug!("S3 DELETE {}", name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<BlobInfo>, StorageError> {
        let mut blobs = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StorageError::S3(format!("list_objects_v2 failed: {}", e)))?;

            if let Some(contents) = response.contents {
                for object in contents {
                    let Some(name) = object.key else { continue };
                    let created_at = object
                        .last_modified
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
                        .unwrap_or_else(Utc::now);
                    blobs.push(BlobInfo {
                        name,
                        size: object.size.unwrap_or(0).max(0) as u64,
                        created_at,
                    });
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        debug!("Listed {} blobs", blobs.len());
        Ok(blobs)
    }
}

/// Random-access handle that issues ranged GETs lazily: a seek only records
/// the position, the next read opens a stream from there.
struct S3BlobRead {
    client: Client,
    bucket: String,
    key: String,
    size: u64,
    pos: u64,
    stream: Option<ByteStream>,
    chunk: Bytes,
}

impl std::fmt::Debug for S3BlobRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3BlobRead")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}

#[async_trait]
impl BlobRead for S3BlobRead {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.chunk.is_empty() {
                let n = buf.len().min(self.chunk.len());
                buf[..n].copy_from_slice(&self.chunk[..n]);
                self.chunk.advance(n);
                self.pos += n as u64;
                return Ok(n);
            }

            if self.stream.is_none() {
                let response = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .range(format!("bytes={}-", self.pos))
                    .send()
                    .await
                    .map_err(|e| {
                        if let SdkError::ServiceError(service_error) = &e {
                            if matches!(service_error.err(), GetObjectError::NoSuchKey(_)) {
                                return StorageError::NotFound(self.key.clone());
                            }
                        }
                        StorageError::S3(format!("get_object failed: {}", e))
                    })?;
                self.stream = Some(response.body);
            }

            let next = match self.stream.as_mut() {
                Some(stream) => stream
                    .try_next()
                    .await
                    .map_err(|e| StorageError::S3(format!("failed to read response body: {}", e)))?,
                None => None,
            };
            match next {
                Some(bytes) => self.chunk = bytes,
                None => {
                    return Err(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("object {} shorter than its recorded size", self.key),
                    )));
                }
            }
        }
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.size as i64 + delta,
        };
        if target < 0 {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            )));
        }
        let target = target as u64;
        if target != self.pos {
            // Drop the in-flight range; the next read re-opens from here.
            self.stream = None;
            self.chunk = Bytes::new();
            self.pos = target;
        }
        Ok(self.pos)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.stream = None;
        self.chunk = Bytes::new();
        Ok(())
    }
}
