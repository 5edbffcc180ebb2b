//! Shared helpers for integration tests
//!
//! Stores are wired to throwaway storage under a TempDir that lives as long
//! as the harness value.

#![allow(dead_code)]

use blobstore::registry::SqliteRegistry;
use blobstore::storage::{DatabaseBackend, FilesystemBackend};
use blobstore::{BlobRead, BlobStore, StoreError, UploadLimits};
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestStore {
    pub store: BlobStore,
    _root: TempDir,
}

/// Limits small enough for hand-sized test parts.
pub fn test_limits() -> UploadLimits {
    UploadLimits {
        min_part_size: 10,
        max_part_size: 64 * 1024 * 1024,
        max_parts: 400,
    }
}

/// Store over the filesystem backend with the default test limits.
pub async fn filesystem_store() -> TestStore {
    filesystem_store_with(test_limits()).await
}

pub async fn filesystem_store_with(limits: UploadLimits) -> TestStore {
    let root = TempDir::new().unwrap();
    let backend = Arc::new(
        FilesystemBackend::new(root.path().to_path_buf())
            .await
            .unwrap(),
    );
    let registry = Arc::new(SqliteRegistry::open_in_memory("test").await.unwrap());
    TestStore {
        store: BlobStore::new(backend, registry, limits),
        _root: root,
    }
}

/// Store over the database-embedded backend, blobs and metadata in one file.
pub async fn database_store() -> TestStore {
    let root = TempDir::new().unwrap();
    let registry = SqliteRegistry::open(&root.path().join("meta.db"), "test")
        .await
        .unwrap();
    let backend = Arc::new(
        DatabaseBackend::with_connection(registry.connection(), "test")
            .await
            .unwrap(),
    );
    TestStore {
        store: BlobStore::new(backend, Arc::new(registry), test_limits()),
        _root: root,
    }
}

pub fn sha384(data: &[u8]) -> String {
    blobstore::hash::of(data)
}

/// Store a whole blob and return its content hash.
pub async fn put_blob(store: &BlobStore, data: &[u8]) -> String {
    let hash = sha384(data);
    let mut reader = data;
    store
        .put(&mut reader, data.len() as u64, &hash)
        .await
        .unwrap();
    hash
}

/// Upload one part, deriving its hash from the bytes.
pub async fn put_part(
    store: &BlobStore,
    id: &str,
    part: i32,
    data: &[u8],
    offset: u64,
) -> Result<String, StoreError> {
    let hash = sha384(data);
    let mut reader = data;
    store
        .put_part(id, part, &mut reader, data.len() as u64, offset, &hash)
        .await?;
    Ok(hash)
}

pub async fn read_all(reader: &mut dyn BlobRead) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}
