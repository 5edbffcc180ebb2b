//! Upload registry: persistent records of in-flight multipart uploads
//!
//! The registry is the serialization point for concurrent part uploads. It
//! offers no locks; instead `init_part` is a conditional update that
//! succeeds only when the part slot is still empty, and losers reconcile by
//! re-reading the document.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

use crate::types::UploadDoc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from the metadata store
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("upload {0} not found")]
    NotFound(String),

    #[error("part {part} of upload {id} already initialized")]
    PartTaken { id: String, part: usize },

    #[error("upload {0} is not finished")]
    NotFinished(String),

    #[error("upload {id} already owned by \"{owner}\"")]
    OwnerMismatch { id: String, owner: String },

    #[error("upload {0} already finished with a different hash")]
    HashConflict(String),

    #[error("metadata database error: {0}")]
    Database(String),

    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Database(e.to_string())
    }
}

/// Persistent store of upload documents.
///
/// Every mutating operation is atomic with respect to the others; the
/// conditional ones (`init_part`, `set_hash`, `set_owner`) embed their
/// precondition in the same transaction that performs the write.
#[async_trait]
pub trait UploadRegistry: Send + Sync {
    /// Insert a fresh document. The id must be unused.
    async fn insert(&self, doc: UploadDoc) -> Result<(), RegistryError>;

    async fn get(&self, id: &str) -> Result<UploadDoc, RegistryError>;

    /// Record the intent to upload a part. Fails with `PartTaken` unless
    /// the slot is currently absent or null; exactly one of any set of
    /// concurrent initializers wins.
    async fn init_part(
        &self,
        id: &str,
        part: usize,
        hash: &str,
        size: u64,
        offset: u64,
    ) -> Result<(), RegistryError>;

    /// Flip a part to complete. Written as a whole-part replacement to
    /// avoid partial-update anomalies.
    async fn complete_part(
        &self,
        id: &str,
        part: usize,
        hash: &str,
        size: u64,
        offset: u64,
    ) -> Result<(), RegistryError>;

    /// Transition the upload to finished. Once set, the hash is frozen;
    /// setting a different value fails with `HashConflict`.
    async fn set_hash(&self, id: &str, hash: &str) -> Result<(), RegistryError>;

    /// Hand the finished upload to an external owner and extend its
    /// expiry. Fails with `NotFinished` before `set_hash`, and with
    /// `OwnerMismatch` when a different owner is already recorded.
    async fn set_owner(
        &self,
        id: &str,
        owner: &str,
        expires: DateTime<Utc>,
    ) -> Result<(), RegistryError>;

    /// Remove the document. Removing an absent document is not an error.
    async fn delete(&self, id: &str) -> Result<(), RegistryError>;

    /// All documents whose expiry precedes `now`.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadDoc>, RegistryError>;

    /// Every live document. The garbage collector uses this to protect
    /// in-flight part blobs.
    async fn all(&self) -> Result<Vec<UploadDoc>, RegistryError>;
}
