//! Composite reader behavior: boundary crossing, lazy opening, seek algebra

mod common;

use async_trait::async_trait;
use blobstore::{Backend, BlobInfo, BlobRead, BlobStore, MultipartIndex, StorageError};
use chrono::{Duration, Utc};
use common::{filesystem_store, put_part, read_all, test_limits};
use proptest::prelude::*;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Uploads parts covering `data` split at the given boundaries and returns
/// the finished `(index, hash)`.
async fn upload_split(
    store: &BlobStore,
    data: &[u8],
    boundaries: &[usize],
) -> (MultipartIndex, String) {
    let id = store
        .new_upload(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    let mut hashes = Vec::new();
    let mut start = 0;
    let mut ends: Vec<usize> = boundaries.to_vec();
    ends.push(data.len());
    for (part, end) in ends.iter().enumerate() {
        let chunk = &data[start..*end];
        hashes.push(
            put_part(store, &id, part as i32, chunk, start as u64)
                .await
                .unwrap(),
        );
        start = *end;
    }
    store.finish_upload(&id, &hashes).await.unwrap()
}

#[tokio::test]
async fn test_read_crosses_part_boundaries() {
    let harness = filesystem_store().await;
    let data: Vec<u8> = (0..64u8).collect();
    let (index, hash) = upload_split(&harness.store, &data, &[20, 40]).await;

    let (mut reader, size) = harness.store.open(&hash, Some(&index)).await.unwrap();
    assert_eq!(size, 64);

    // One large read spans all three parts.
    let mut buf = [0u8; 64];
    let n = reader.read(&mut buf).await.unwrap();
    assert_eq!(n, 64);
    assert_eq!(&buf[..], &data[..]);

    // At end of stream reads return 0.
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_seek_then_read_lands_mid_part() {
    let harness = filesystem_store().await;
    let data: Vec<u8> = (0..60u8).collect();
    let (index, hash) = upload_split(&harness.store, &data, &[15, 30, 45]).await;

    let (mut reader, _) = harness.store.open(&hash, Some(&index)).await.unwrap();

    // Into the middle of part 2.
    let pos = reader.seek(SeekFrom::Start(37)).await.unwrap();
    assert_eq!(pos, 37);
    assert_eq!(read_all(reader.as_mut()).await, &data[37..]);

    // Backwards from the end.
    reader.seek(SeekFrom::End(-5)).await.unwrap();
    assert_eq!(read_all(reader.as_mut()).await, &data[55..]);
}

#[tokio::test]
async fn test_seek_clamps_out_of_range_targets() {
    let harness = filesystem_store().await;
    let data: Vec<u8> = (0..46u8).collect();
    let (index, hash) = upload_split(&harness.store, &data, &[20]).await;

    let (mut reader, _) = harness.store.open(&hash, Some(&index)).await.unwrap();

    assert_eq!(reader.seek(SeekFrom::Current(-10)).await.unwrap(), 0);
    assert_eq!(reader.seek(SeekFrom::Start(1000)).await.unwrap(), 46);
    assert_eq!(reader.seek(SeekFrom::End(17)).await.unwrap(), 46);
    assert_eq!(reader.seek(SeekFrom::End(-1000)).await.unwrap(), 0);

    // Reading at or past end returns 0 bytes.
    reader.seek(SeekFrom::Start(1000)).await.unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
}

/// Backend wrapper that counts `get` calls.
struct CountingBackend {
    inner: Arc<dyn Backend>,
    gets: Arc<AtomicUsize>,
}

#[async_trait]
impl Backend for CountingBackend {
    async fn put(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        hash: &str,
    ) -> Result<(), StorageError> {
        self.inner.put(name, reader, size, hash).await
    }

    async fn get(&self, name: &str) -> Result<(Box<dyn BlobRead>, u64), StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(name).await
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.inner.remove(name).await
    }

    async fn list(&self) -> Result<Vec<BlobInfo>, StorageError> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn test_open_seek_close_without_reads_touches_no_part() {
    let root = tempfile::TempDir::new().unwrap();
    let fs = Arc::new(
        blobstore::storage::FilesystemBackend::new(root.path().to_path_buf())
            .await
            .unwrap(),
    );
    let gets = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(CountingBackend {
        inner: fs,
        gets: Arc::clone(&gets),
    });
    let registry = Arc::new(
        blobstore::registry::SqliteRegistry::open_in_memory("test")
            .await
            .unwrap(),
    );
    let store = BlobStore::new(backend, registry, test_limits());

    let data: Vec<u8> = (0..40u8).collect();
    let (index, hash) = upload_split(&store, &data, &[20]).await;

    let baseline = gets.load(Ordering::SeqCst);
    let (mut reader, _) = store.open(&hash, Some(&index)).await.unwrap();
    reader.seek(SeekFrom::Start(25)).await.unwrap();
    reader.seek(SeekFrom::Current(-10)).await.unwrap();
    reader.close().await.unwrap();
    assert_eq!(gets.load(Ordering::SeqCst), baseline);

    // The first actual read opens exactly one part.
    let (mut reader, _) = store.open(&hash, Some(&index)).await.unwrap();
    reader.seek(SeekFrom::Start(5)).await.unwrap();
    let mut buf = [0u8; 4];
    reader.read(&mut buf).await.unwrap();
    assert_eq!(gets.load(Ordering::SeqCst), baseline + 1);
    assert_eq!(&buf, &data[5..9]);
}

fn parts_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    // Non-tail parts meet the 10-byte test minimum; the tail may be tiny.
    (
        proptest::collection::vec(proptest::collection::vec(any::<u8>(), 10..40), 0..3),
        proptest::collection::vec(any::<u8>(), 1..40),
    )
        .prop_map(|(mut parts, tail)| {
            parts.push(tail);
            parts
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_roundtrip_any_partition(parts in parts_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let harness = filesystem_store().await;
            let store = &harness.store;
            let id = store
                .new_upload(Utc::now() + Duration::minutes(1))
                .await
                .unwrap();

            let mut hashes = Vec::new();
            let mut offset = 0u64;
            let mut whole = Vec::new();
            for (part, chunk) in parts.iter().enumerate() {
                hashes.push(put_part(store, &id, part as i32, chunk, offset).await.unwrap());
                offset += chunk.len() as u64;
                whole.extend_from_slice(chunk);
            }

            let (index, hash) = store.finish_upload(&id, &hashes).await.unwrap();
            assert_eq!(hash, common::sha384(&whole));

            let (mut reader, size) = store.open(&hash, Some(&index)).await.unwrap();
            assert_eq!(size, whole.len() as u64);
            assert_eq!(read_all(reader.as_mut()).await, whole);
        });
    }

    #[test]
    fn prop_seek_algebra(a in 0u64..=46, b in -150i64..150, c in -150i64..50) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let harness = filesystem_store().await;
            // Seeks never open a part, so the index needs no backing blobs.
            let index = MultipartIndex {
                sizes: vec![20, 26],
                hashes: vec![common::sha384(b"p0"), common::sha384(b"p1")],
            };
            let total = 46i64;
            let (mut reader, _) = harness.store.open("", Some(&index)).await.unwrap();

            reader.seek(SeekFrom::Start(a)).await.unwrap();
            let pos = reader.seek(SeekFrom::Current(b)).await.unwrap();
            assert_eq!(pos, (a as i64 + b).clamp(0, total) as u64);

            let pos = reader.seek(SeekFrom::End(c)).await.unwrap();
            assert_eq!(pos, (total + c).clamp(0, total) as u64);
        });
    }
}
