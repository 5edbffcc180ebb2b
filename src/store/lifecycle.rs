//! Upload lifecycle: ownership handoff, expiry sweep, garbage collection

use super::{BlobStore, StoreError};
use crate::registry::RegistryError;
use crate::types::{GcStats, SweepStats, UploadDoc};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info};

/// Callback into the external owner's records: does some persistent record
/// of `owner` still reference this upload?
#[async_trait]
pub trait OwnershipCheck: Send + Sync {
    async fn is_owned_by(&self, upload_id: &str, owner: &str) -> Result<bool, StoreError>;
}

impl BlobStore {
    /// Transfer a finished upload to a durable owner and extend its expiry.
    /// Idempotent for the same owner; a different owner is rejected.
    pub async fn set_owner(
        &self,
        id: &str,
        owner: &str,
        expires: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.registry.set_owner(id, owner, expires).await {
            Ok(()) => {
                debug!("Upload {} owned by \"{}\"", id, owner);
                Ok(())
            }
            Err(RegistryError::NotFound(_)) => {
                Err(StoreError::NotFound("upload has been removed".to_string()))
            }
            Err(RegistryError::NotFinished(_)) => Err(StoreError::IncompleteUpload),
            Err(RegistryError::OwnerMismatch { .. }) => Err(StoreError::AlreadyOwned),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an upload and, unless a live owner still references it, its
    /// part blobs. Removing an absent upload succeeds.
    pub async fn remove_upload(
        &self,
        id: &str,
        check: Option<&dyn OwnershipCheck>,
    ) -> Result<(), StoreError> {
        let doc = match self.registry.get(id).await {
            Ok(doc) => doc,
            Err(RegistryError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.remove_doc(&doc, check).await?;
        Ok(())
    }

    /// Shared removal path; returns how many part blobs were deleted.
    async fn remove_doc(
        &self,
        doc: &UploadDoc,
        check: Option<&dyn OwnershipCheck>,
    ) -> Result<u64, StoreError> {
        let still_referenced = match (&doc.owner, check) {
            (Some(owner), Some(check)) => check.is_owned_by(&doc.id, owner).await?,
            _ => false,
        };

        let mut removed = 0;
        if still_referenced {
            debug!("Upload {} still referenced; keeping part blobs", doc.id);
        } else {
            for part in doc.parts.iter().flatten() {
                match self.backend.remove(&part.hash).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.registry.delete(&doc.id).await?;
        debug!("Removed upload {} ({} part blobs)", doc.id, removed);
        Ok(removed)
    }

    /// Apply `remove_upload` semantics to every upload whose expiry has
    /// passed.
    pub async fn remove_expired_uploads(
        &self,
        check: Option<&dyn OwnershipCheck>,
    ) -> Result<SweepStats, StoreError> {
        let mut stats = SweepStats::default();
        for doc in self.registry.expired(Utc::now()).await? {
            stats.blobs_removed += self.remove_doc(&doc, check).await?;
            stats.uploads_removed += 1;
        }
        if stats.uploads_removed > 0 {
            info!(
                "Expiry sweep removed {} uploads and {} part blobs",
                stats.uploads_removed, stats.blobs_removed
            );
        }
        Ok(stats)
    }

    /// Delete every stored blob that is neither in `active_refs`, nor a
    /// part of a live upload, nor created at or after `cutoff`.
    ///
    /// `cutoff` guards blobs whose metadata write is still racing: anything
    /// written within `[cutoff, now]` survives even when unreferenced.
    pub async fn gc(
        &self,
        active_refs: &HashSet<String>,
        cutoff: DateTime<Utc>,
    ) -> Result<GcStats, StoreError> {
        let mut keep = active_refs.clone();
        for doc in self.registry.all().await? {
            for part in doc.parts.iter().flatten() {
                keep.insert(part.hash.clone());
            }
        }

        let mut stats = GcStats::default();
        for blob in self.backend.list().await? {
            stats.scanned += 1;
            if keep.contains(&blob.name) || blob.created_at >= cutoff {
                continue;
            }
            match self.backend.remove(&blob.name).await {
                Ok(()) => {
                    stats.deleted += 1;
                    stats.deleted_bytes += blob.size;
                }
                // Someone else already swept it.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(
            "GC scanned {} blobs, deleted {} ({} bytes)",
            stats.scanned, stats.deleted, stats.deleted_bytes
        );
        Ok(stats)
    }
}
