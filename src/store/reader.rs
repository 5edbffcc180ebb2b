//! Composite reader over the parts of a finished multipart upload
//!
//! Presents the logical concatenation as one seekable stream. Part blobs
//! are opened lazily as reads cross their boundaries and the previous part
//! is closed on advance, so `open` + `close` with no reads touches no blob
//! at all.

use crate::storage::{Backend, BlobRead, StorageError};
use crate::types::MultipartIndex;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::sync::Arc;

pub struct MultiReader {
    backend: Arc<dyn Backend>,
    index: MultipartIndex,
    /// Byte offset at which each part starts.
    offsets: Vec<u64>,
    total: u64,
    pos: u64,
    current: Option<CurrentPart>,
}

impl std::fmt::Debug for MultiReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiReader")
            .field("total", &self.total)
            .field("pos", &self.pos)
            .field("current", &self.current)
            .finish()
    }
}

struct CurrentPart {
    idx: usize,
    reader: Box<dyn BlobRead>,
    /// Position of `reader` within its part.
    local_pos: u64,
}

impl std::fmt::Debug for CurrentPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrentPart")
            .field("idx", &self.idx)
            .field("local_pos", &self.local_pos)
            .finish()
    }
}

impl MultiReader {
    pub(crate) fn new(backend: Arc<dyn Backend>, index: MultipartIndex) -> Self {
        let mut offsets = Vec::with_capacity(index.sizes.len());
        let mut acc = 0u64;
        for size in &index.sizes {
            offsets.push(acc);
            acc += size;
        }
        Self {
            backend,
            index,
            offsets,
            total: acc,
            pos: 0,
            current: None,
        }
    }

    /// Total logical size of the stream.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Index of the part containing `pos`. Caller guarantees `pos < total`.
    fn part_at(&self, pos: u64) -> usize {
        self.offsets.partition_point(|&start| start <= pos) - 1
    }
}

#[async_trait]
impl BlobRead for MultiReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let mut filled = 0;
        while filled < buf.len() && self.pos < self.total {
            let idx = self.part_at(self.pos);

            if self.current.as_ref().map(|c| c.idx) != Some(idx) {
                if let Some(mut old) = self.current.take() {
                    let _ = old.reader.close().await;
                }
                let (reader, _) = self.backend.get(&self.index.hashes[idx]).await?;
                self.current = Some(CurrentPart {
                    idx,
                    reader,
                    local_pos: 0,
                });
            }
            let Some(current) = self.current.as_mut() else {
                break;
            };

            let local = self.pos - self.offsets[idx];
            if current.local_pos != local {
                current.reader.seek(SeekFrom::Start(local)).await?;
                current.local_pos = local;
            }

            let part_remaining = (self.index.sizes[idx] - local) as usize;
            let want = (buf.len() - filled).min(part_remaining);
            let n = current.reader.read(&mut buf[filled..filled + want]).await?;
            if n == 0 {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("part {} shorter than its recorded size", idx),
                )));
            }
            current.local_pos += n as u64;
            self.pos += n as u64;
            filled += n;
        }
        Ok(filled)
    }

    /// Reposition the stream. Out-of-range targets clamp to `[0, total]`;
    /// no part is loaded until the next read.
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.total as i64 + delta,
        };
        self.pos = target.clamp(0, self.total as i64) as u64;
        Ok(self.pos)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        if let Some(mut current) = self.current.take() {
            current.reader.close().await?;
        }
        Ok(())
    }
}
