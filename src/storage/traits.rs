//! Storage backend trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::SeekFrom;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("hash mismatch for \"{name}\": bytes hash to {got}")]
    HashMismatch { name: String, got: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk full: insufficient storage space")]
    DiskFull,

    #[error("database error: {0}")]
    Database(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Sweep callers treat a missing object as already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A stored blob as seen by the garbage collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Random-access handle onto a single stored blob (or, via the composite
/// reader, a logical multipart blob).
///
/// `read` may return fewer bytes than requested; 0 means end of stream.
/// `seek` follows `std::io::SeekFrom` semantics within the object.
#[async_trait]
pub trait BlobRead: Send + std::fmt::Debug {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError>;

    /// Release any underlying handle early. Dropping the reader has the
    /// same effect.
    async fn close(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Abstract backend for hash-verified blob storage: opaque byte streams
/// keyed by a string name.
///
/// This trait is object-safe and is used as `Arc<dyn Backend>` above the
/// storage layer; dynamic dispatch is confined to this boundary.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Write exactly `size` bytes read from `reader` under `name`. The
    /// bytes are hashed while streaming; if the digest differs from `hash`
    /// the write fails with `HashMismatch` and any partially written
    /// object is removed before returning.
    async fn put(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        hash: &str,
    ) -> Result<(), StorageError>;

    /// Open `name` for random-access reading. Returns the handle and the
    /// object's size.
    async fn get(&self, name: &str) -> Result<(Box<dyn BlobRead>, u64), StorageError>;

    /// Delete `name`. A missing object is reported as `NotFound`; callers
    /// doing sweeps ignore that.
    async fn remove(&self, name: &str) -> Result<(), StorageError>;

    /// Enumerate all stored blobs with their creation times. Iteration
    /// primitive for the garbage collector.
    async fn list(&self) -> Result<Vec<BlobInfo>, StorageError>;
}
