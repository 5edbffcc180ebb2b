//! Filesystem-based storage backend
//!
//! Blobs live as flat files named by their content hash under the root
//! directory. Writes stream into a `.tmp/` staging area and are renamed
//! into place only after the hash has been verified, so a crashed or
//! cancelled write never leaves a visible partial object.

use super::traits::{Backend, BlobInfo, BlobRead, StorageError};
use crate::hash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::Digest;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};

/// Async-safe path existence check (avoids blocking the Tokio runtime)
async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// ENOSPC raw error code on Linux and macOS.
const ENOSPC: i32 = 28;

/// Convert an io::Error into StorageError, detecting disk-full (ENOSPC).
fn io_to_storage_error(e: std::io::Error) -> StorageError {
    if e.raw_os_error() == Some(ENOSPC) {
        StorageError::DiskFull
    } else {
        StorageError::Io(e)
    }
}

/// Name of the staging directory, excluded from `list`.
const TMP_DIR: &str = ".tmp";

/// Filesystem storage backend
///
/// Storage layout:
/// ```text
/// {root}/{hash}        # Blob data, named by content hash
/// {root}/.tmp/{...}    # Staging area for in-flight writes
/// ```
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given root directory
    pub async fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(root.join(TMP_DIR)).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.root
            .join(TMP_DIR)
            .join(format!("{}.{:016x}", name, rand::random::<u64>()))
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    #[instrument(skip(self, reader))]
    async fn put(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        hash: &str,
    ) -> Result<(), StorageError> {
        let staging = self.staging_path(name);
        let result = write_verified(&staging, reader, size, hash).await;

        match result {
            Ok(()) => {
                fs::rename(&staging, self.blob_path(name))
                    .await
                    .map_err(io_to_storage_error)?;
                debug!("Wrote blob {} ({} bytes)", name, size);
                Ok(())
            }
            Err(e) => {
                // The partial object must not survive a failed put.
                let _ = fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<(Box<dyn BlobRead>, u64), StorageError> {
        let path = self.blob_path(name);
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        debug!("Opened blob {} ({} bytes)", name, size);
        Ok((Box::new(FileBlobRead { file }), size))
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.blob_path(name);
        if !path_exists(&path).await {
            return Err(StorageError::NotFound(name.to_string()));
        }
        fs::remove_file(&path).await?;
        debug!("Deleted blob {}", name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<BlobInfo>, StorageError> {
        let mut blobs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let ft = entry.file_type().await?;
            if !ft.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let meta = entry.metadata().await?;
            let created_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            blobs.push(BlobInfo {
                name,
                size: meta.len(),
                created_at,
            });
        }
        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Listed {} blobs", blobs.len());
        Ok(blobs)
    }
}

/// Stream exactly `size` bytes into `path`, hashing along the way, and
/// fsync. Fails with `HashMismatch` when the digest differs from `want`.
async fn write_verified(
    path: &Path,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    size: u64,
    want: &str,
) -> Result<(), StorageError> {
    let mut file = fs::File::create(path).await.map_err(io_to_storage_error)?;
    let mut hasher = hash::new_hasher();
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
        file.write_all(&buf[..n]).await.map_err(io_to_storage_error)?;
        remaining -= n as u64;
    }

    let got = hash::hex_digest(hasher);
    if got != want {
        return Err(StorageError::HashMismatch {
            name: want.to_string(),
            got,
        });
    }

    file.sync_all().await.map_err(io_to_storage_error)?;
    Ok(())
}

/// Random-access handle backed by an open file.
struct FileBlobRead {
    file: fs::File,
}

impl std::fmt::Debug for FileBlobRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlobRead").finish()
    }
}

#[async_trait]
impl BlobRead for FileBlobRead {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        Ok(self.file.read(buf).await?)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        Ok(self.file.seek(pos).await?)
    }
}
