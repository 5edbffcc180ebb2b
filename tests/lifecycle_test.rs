//! Ownership handoff, upload removal, expiry sweep and garbage collection

mod common;

use async_trait::async_trait;
use blobstore::{BlobStore, OwnershipCheck, StoreError};
use chrono::{Duration, Utc};
use common::{filesystem_store, put_blob, put_part};
use std::collections::HashSet;

const PART0: &[u8] = b"123456789 123456789 ";
const PART1: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Ownership check with a fixed answer.
struct Referenced(bool);

#[async_trait]
impl OwnershipCheck for Referenced {
    async fn is_owned_by(&self, _upload_id: &str, _owner: &str) -> Result<bool, StoreError> {
        Ok(self.0)
    }
}

async fn finished_upload(store: &BlobStore) -> (String, Vec<String>) {
    let id = store
        .new_upload(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    let h0 = put_part(store, &id, 0, PART0, 0).await.unwrap();
    let h1 = put_part(store, &id, 1, PART1, 20).await.unwrap();
    store
        .finish_upload(&id, &[h0.clone(), h1.clone()])
        .await
        .unwrap();
    (id, vec![h0, h1])
}

#[tokio::test]
async fn test_owner_handoff_and_removal() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let (id, _) = finished_upload(store).await;
    let expires = Utc::now() + Duration::minutes(10);

    store.set_owner(&id, "test", expires).await.unwrap();

    let err = store.set_owner(&id, "other", expires).await.unwrap_err();
    assert_eq!(err.to_string(), "upload already used by something else");
    assert!(matches!(err, StoreError::AlreadyOwned));

    // Re-confirming the same owner succeeds.
    store.set_owner(&id, "test", expires).await.unwrap();

    store.remove_upload(&id, None).await.unwrap();

    let err = store.set_owner(&id, "test", expires).await.unwrap_err();
    assert_eq!(err.to_string(), "upload has been removed");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_set_owner_requires_finished_upload() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let id = store
        .new_upload(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    put_part(store, &id, 0, PART0, 0).await.unwrap();

    let err = store
        .set_owner(&id, "test", Utc::now() + Duration::minutes(10))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "cannot set owner on incomplete upload");
    assert!(matches!(err, StoreError::IncompleteUpload));
}

#[tokio::test]
async fn test_set_owner_extends_expiry() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let (id, _) = finished_upload(store).await;

    let extended = Utc::now() + Duration::hours(6);
    store.set_owner(&id, "test", extended).await.unwrap();

    let info = store.upload_info(&id).await.unwrap();
    assert_eq!(info.expires.timestamp_micros(), extended.timestamp_micros());
    assert_eq!(info.owner.as_deref(), Some("test"));
}

#[tokio::test]
async fn test_remove_unowned_upload_deletes_part_blobs() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let (id, hashes) = finished_upload(store).await;

    store.remove_upload(&id, None).await.unwrap();

    assert!(store.upload_info(&id).await.unwrap_err().is_not_found());
    for hash in &hashes {
        assert!(store.open(hash, None).await.unwrap_err().is_not_found());
    }

    // Removing an absent upload succeeds.
    store.remove_upload(&id, None).await.unwrap();
}

#[tokio::test]
async fn test_remove_referenced_upload_keeps_part_blobs() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let (id, hashes) = finished_upload(store).await;
    store
        .set_owner(&id, "test", Utc::now() + Duration::minutes(10))
        .await
        .unwrap();

    store
        .remove_upload(&id, Some(&Referenced(true)))
        .await
        .unwrap();

    // The document is gone but the owner still relies on the blobs.
    assert!(store.upload_info(&id).await.unwrap_err().is_not_found());
    for hash in &hashes {
        store.open(hash, None).await.unwrap();
    }
}

#[tokio::test]
async fn test_remove_orphaned_upload_deletes_part_blobs() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let (id, hashes) = finished_upload(store).await;
    store
        .set_owner(&id, "test", Utc::now() + Duration::minutes(10))
        .await
        .unwrap();

    store
        .remove_upload(&id, Some(&Referenced(false)))
        .await
        .unwrap();

    for hash in &hashes {
        assert!(store.open(hash, None).await.unwrap_err().is_not_found());
    }
}

#[tokio::test]
async fn test_expiry_sweep_removes_stale_uploads() {
    let harness = filesystem_store().await;
    let store = &harness.store;

    // Already expired at creation; enforcement happens in the sweep.
    let stale = store
        .new_upload(Utc::now() - Duration::minutes(1))
        .await
        .unwrap();
    let stale_hash = put_part(store, &stale, 0, PART0, 0).await.unwrap();

    let (live, live_hashes) = finished_upload(store).await;

    let stats = store.remove_expired_uploads(None).await.unwrap();
    assert_eq!(stats.uploads_removed, 1);
    assert_eq!(stats.blobs_removed, 1);

    assert!(store.upload_info(&stale).await.unwrap_err().is_not_found());
    assert!(store.open(&stale_hash, None).await.unwrap_err().is_not_found());

    // The live upload is untouched.
    store.upload_info(&live).await.unwrap();
    for hash in &live_hashes {
        store.open(hash, None).await.unwrap();
    }
}

#[tokio::test]
async fn test_gc_respects_cutoff() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let hash = put_blob(store, b"unreferenced but fresh").await;

    // Everything here was written after the cutoff: nothing may go, even
    // with an empty reference set.
    let stats = store
        .gc(&HashSet::new(), Utc::now() - Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(stats.deleted, 0);
    store.open(&hash, None).await.unwrap();
}

#[tokio::test]
async fn test_gc_deletes_unreferenced_blobs_past_cutoff() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let orphan = put_blob(store, b"orphaned content here").await;
    let kept = put_blob(store, b"externally referenced").await;

    let mut refs = HashSet::new();
    refs.insert(kept.clone());

    let stats = store
        .gc(&refs, Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(stats.scanned, 2);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.deleted_bytes, 21);

    assert!(store.open(&orphan, None).await.unwrap_err().is_not_found());
    store.open(&kept, None).await.unwrap();
}

#[tokio::test]
async fn test_gc_protects_parts_of_live_uploads() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let id = store
        .new_upload(Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    let part_hash = put_part(store, &id, 0, PART0, 0).await.unwrap();

    // Aggressive cutoff, no external refs: the in-flight part survives
    // because its upload document is live.
    let stats = store
        .gc(&HashSet::new(), Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(stats.deleted, 0);
    store.open(&part_hash, None).await.unwrap();

    // Once the upload is gone the part is collectable.
    store.remove_upload(&id, None).await.unwrap();
    let hash = put_blob(store, b"decoy to keep list busy").await;
    let mut refs = HashSet::new();
    refs.insert(hash);
    let stats = store
        .gc(&refs, Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    // remove_upload already deleted the blob; nothing left to collect.
    assert_eq!(stats.deleted, 0);
}

#[tokio::test]
async fn test_gc_after_doc_only_removal_collects_orphans() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let (id, hashes) = finished_upload(store).await;
    store
        .set_owner(&id, "test", Utc::now() + Duration::minutes(10))
        .await
        .unwrap();

    // Owner still referenced at removal time, so only the doc went away.
    store
        .remove_upload(&id, Some(&Referenced(true)))
        .await
        .unwrap();

    // Later the owner drops its reference; GC reclaims the blobs.
    let stats = store
        .gc(&HashSet::new(), Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(stats.deleted, 2);
    for hash in &hashes {
        assert!(store.open(hash, None).await.unwrap_err().is_not_found());
    }
}

#[tokio::test]
async fn test_expired_sweep_respects_ownership_callback() {
    let harness = filesystem_store().await;
    let store = &harness.store;
    let (id, hashes) = finished_upload(store).await;
    // Owned, but the expiry is forced into the past.
    store
        .set_owner(&id, "test", Utc::now() - Duration::minutes(1))
        .await
        .unwrap();

    let stats = store
        .remove_expired_uploads(Some(&Referenced(true)))
        .await
        .unwrap();
    assert_eq!(stats.uploads_removed, 1);
    assert_eq!(stats.blobs_removed, 0);
    for hash in &hashes {
        store.open(hash, None).await.unwrap();
    }
}
