//! Store-level error types

use crate::registry::RegistryError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors produced by the blob store API.
///
/// Validation errors carry a stable kind plus the human-readable message;
/// callers translate kinds to transport codes. Transient backend and
/// metadata errors propagate with their cause preserved under `Storage` /
/// `Registry`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("implausible hash \"{0}\"")]
    ImplausibleHash(String),

    #[error("negative part number")]
    NegativePart,

    #[error("part number {part} too big (maximum {max})")]
    PartNumberTooBig { part: i32, max: usize },

    #[error("non-positive part size")]
    NonPositivePartSize,

    #[error("part too big ({size} bytes, maximum {max})")]
    PartTooBig { size: u64, max: u64 },

    #[error("part {part} was too small (need at least {min} bytes, got {size})")]
    PartTooSmall { part: usize, min: u64, size: u64 },

    #[error("part {part} should start at {expected} not at {got}")]
    PartWrongOffset { part: usize, expected: u64, got: u64 },

    /// The uploaded bytes do not hash to the declared value. The caller
    /// should re-send the body or re-derive the hash; this is never a
    /// transport error.
    #[error("{0}")]
    HashMismatch(String),

    /// The part number already carries different committed content.
    #[error("part {0} already uploaded with a different hash")]
    HashMismatchForUploadedPart(usize),

    #[error("part count mismatch (got {got}, want {want})")]
    PartCountMismatch { got: usize, want: usize },

    #[error("hash mismatch for part {0}")]
    PartHashMismatch(usize),

    #[error("part {0} not uploaded yet")]
    PartNotUploadedYet(usize),

    #[error("cannot set owner on incomplete upload")]
    IncompleteUpload,

    #[error("upload already used by something else")]
    AlreadyOwned,

    /// The upload or one of its part blobs disappeared under a concurrent
    /// removal or expiry sweep.
    #[error("upload expired or removed")]
    UploadExpiredOrRemoved,

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Registry(RegistryError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(name) => StoreError::NotFound(format!("{} not found", name)),
            other => StoreError::Storage(other),
        }
    }
}

impl From<RegistryError> for StoreError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => {
                StoreError::NotFound(format!("upload {} not found", id))
            }
            RegistryError::NotFinished(_) => StoreError::IncompleteUpload,
            RegistryError::OwnerMismatch { .. } => StoreError::AlreadyOwned,
            other => StoreError::Registry(other),
        }
    }
}
