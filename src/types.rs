//! Core data model: upload documents, the multipart index, sweep statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One segment of a multipart upload.
///
/// `complete` flips from false to true only after the backend write for the
/// part succeeded; readers never observe a half-written part through a
/// finished upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPart {
    /// Lowercase hex SHA-384 of the part bytes; also the backend key.
    pub hash: String,
    /// Byte length, strictly positive.
    pub size: u64,
    /// Byte offset of this part within the logical blob, as claimed by the
    /// uploader. Validated against the preceding parts' sizes as soon as
    /// those are known.
    pub offset: u64,
    pub complete: bool,
}

/// Persistent record of one in-flight multipart upload.
///
/// Serialized shape matches the stored document:
/// `{ id, expires, hash?, owner?, parts: [ {hash,size,offset,complete} | null, ... ] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDoc {
    pub id: String,
    /// Absolute time after which the upload and its part blobs are eligible
    /// for the expiry sweep.
    pub expires: DateTime<Utc>,
    /// Hash of the logical concatenation of all parts; set by finish and
    /// frozen thereafter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// External entity that has taken ownership of the finished upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Ordered by part number; holes are permitted while in progress.
    pub parts: Vec<Option<UploadPart>>,
}

impl UploadDoc {
    /// Index of the highest part number currently known, if any.
    pub fn highest_part(&self) -> Option<usize> {
        self.parts.iter().rposition(|p| p.is_some())
    }

    /// The per-part index of a finished upload. `None` while any part slot
    /// is still a hole.
    pub fn index(&self) -> Option<MultipartIndex> {
        let mut sizes = Vec::with_capacity(self.parts.len());
        let mut hashes = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let part = part.as_ref()?;
            sizes.push(part.size);
            hashes.push(part.hash.clone());
        }
        Some(MultipartIndex { sizes, hashes })
    }
}

/// Locates every part of a finished multipart upload: `hashes[i]` is the
/// backend key of part *i*, `sizes[i]` its length. Together they establish
/// byte offsets for seeking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartIndex {
    pub sizes: Vec<u64>,
    pub hashes: Vec<String>,
}

impl MultipartIndex {
    /// Total logical size of the assembled blob.
    pub fn total_size(&self) -> u64 {
        self.sizes.iter().sum()
    }
}

/// Outcome of one garbage-collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Blobs enumerated in the backend.
    pub scanned: u64,
    /// Blobs deleted (unreferenced and older than the cutoff).
    pub deleted: u64,
    /// Bytes reclaimed by the deletions.
    pub deleted_bytes: u64,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub uploads_removed: u64,
    pub blobs_removed: u64,
}
