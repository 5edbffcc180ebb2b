//! Part coordinator: the multipart-upload state machine
//!
//! Upholds the part invariants against concurrent, duplicate, out-of-order
//! and failing requests. There are no locks here: the registry's
//! conditional `init_part` serializes racing initializers of one part
//! number, and the backend's content-addressed naming makes racing writes
//! of the same content converge.

use super::{BlobStore, StoreError};
use crate::hash;
use crate::registry::RegistryError;
use crate::storage::StorageError;
use crate::types::{MultipartIndex, UploadDoc};
use sha2::Digest;
use tokio::io::AsyncRead;
use tracing::debug;

impl BlobStore {
    /// Upload one part of a multipart upload.
    ///
    /// `offset` is the byte position the caller claims for this part within
    /// the logical blob; it is validated against the preceding parts' sizes
    /// as soon as those are known. Re-sending a committed part with the
    /// same content is a no-op; re-sending it with different content fails
    /// with `HashMismatchForUploadedPart`.
    pub async fn put_part(
        &self,
        id: &str,
        part: i32,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        offset: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        if part < 0 {
            return Err(StoreError::NegativePart);
        }
        let part_idx = part as usize;
        if part_idx >= self.limits.max_parts {
            return Err(StoreError::PartNumberTooBig {
                part,
                max: self.limits.max_parts,
            });
        }
        if size == 0 {
            return Err(StoreError::NonPositivePartSize);
        }
        if size > self.limits.max_part_size {
            return Err(StoreError::PartTooBig {
                size,
                max: self.limits.max_part_size,
            });
        }
        if !hash::is_plausible(hash) {
            return Err(StoreError::ImplausibleHash(hash.to_string()));
        }

        let doc = self.registry.get(id).await?;

        // A finished upload's part set is frozen; new part numbers are out
        // of range for it. Re-sends of committed parts fall through to the
        // idempotence rules below.
        if doc.hash.is_some() && part_idx >= doc.parts.len() {
            return Err(StoreError::PartNumberTooBig {
                part,
                max: doc.parts.len(),
            });
        }

        self.check_part_sizes(&doc, part_idx, size)?;
        check_offsets(&doc, part_idx, size, offset)?;

        // Idempotence against the already-known record for this part.
        if let Some(existing) = doc.parts.get(part_idx).cloned().flatten() {
            if existing.hash != hash {
                return Err(StoreError::HashMismatchForUploadedPart(part_idx));
            }
            if existing.complete {
                debug!("Part {}/{} already complete, skipping", id, part);
                return Ok(());
            }
            // A previous attempt failed between the backend put and the
            // complete flip; re-upload the body.
            self.upload_part_body(id, part, reader, size, hash).await?;
            self.registry
                .complete_part(id, part_idx, hash, size, offset)
                .await?;
            return Ok(());
        }

        // Establish intent. On contention the loser re-reads and either
        // finds its equivalent part or a conflicting one.
        match self
            .registry
            .init_part(id, part_idx, hash, size, offset)
            .await
        {
            Ok(()) => {}
            Err(RegistryError::PartTaken { .. }) => {
                let doc = self.registry.get(id).await?;
                let winner = doc
                    .parts
                    .get(part_idx)
                    .cloned()
                    .flatten()
                    .ok_or(StoreError::UploadExpiredOrRemoved)?;
                if winner.hash != hash {
                    return Err(StoreError::HashMismatchForUploadedPart(part_idx));
                }
                if winner.complete {
                    debug!("Part {}/{} completed concurrently", id, part);
                    return Ok(());
                }
                // Equivalent in-flight record: carry on and upload the body.
            }
            Err(e) => return Err(e.into()),
        }

        self.upload_part_body(id, part, reader, size, hash).await?;
        self.registry
            .complete_part(id, part_idx, hash, size, offset)
            .await?;
        debug!("Uploaded part {}/{} ({} bytes)", id, part, size);
        Ok(())
    }

    /// Stream the part body into the backend under its content hash. A hash
    /// mismatch leaves the part's initial record in place so a retry with
    /// the correct content can succeed without another allocation round.
    async fn upload_part_body(
        &self,
        id: &str,
        part: i32,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        match self.backend.put(hash, reader, size, hash).await {
            Ok(()) => Ok(()),
            Err(StorageError::HashMismatch { .. }) => Err(StoreError::HashMismatch(format!(
                "cannot upload part \"{}/{}\": hash mismatch",
                id, part
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Every part that stops being the tail once `part_idx` lands must meet
    /// the minimum part size; only the tail is exempt.
    fn check_part_sizes(
        &self,
        doc: &UploadDoc,
        part_idx: usize,
        size: u64,
    ) -> Result<(), StoreError> {
        let min = self.limits.min_part_size;
        let highest = doc.highest_part().map_or(part_idx, |h| h.max(part_idx));

        for (j, slot) in doc.parts.iter().enumerate() {
            if j == part_idx {
                continue;
            }
            if let Some(existing) = slot {
                if j < highest && existing.size < min {
                    return Err(StoreError::PartTooSmall {
                        part: j,
                        min,
                        size: existing.size,
                    });
                }
            }
        }
        if part_idx < highest && size < min {
            return Err(StoreError::PartTooSmall {
                part: part_idx,
                min,
                size,
            });
        }
        Ok(())
    }

    /// Finish a multipart upload: validate the caller's claimed part
    /// sequence against the document, hash the logical concatenation by
    /// streaming each part blob, and freeze the result.
    ///
    /// Finishing an already-finished upload with the same part hashes is a
    /// no-op returning the same index and hash.
    pub async fn finish_upload(
        &self,
        id: &str,
        part_hashes: &[String],
    ) -> Result<(MultipartIndex, String), StoreError> {
        let doc = self.registry.get(id).await?;

        if let Some(stored) = &doc.hash {
            let unchanged = doc.parts.len() == part_hashes.len()
                && doc
                    .parts
                    .iter()
                    .zip(part_hashes)
                    .all(|(slot, h)| slot.as_ref().map(|p| &p.hash) == Some(h));
            if unchanged {
                if let Some(index) = doc.index() {
                    debug!("Upload {} already finished", id);
                    return Ok((index, stored.clone()));
                }
            }
        }

        if part_hashes.len() != doc.parts.len() {
            return Err(StoreError::PartCountMismatch {
                got: part_hashes.len(),
                want: doc.parts.len(),
            });
        }
        let mut sizes = Vec::with_capacity(doc.parts.len());
        for (i, slot) in doc.parts.iter().enumerate() {
            let Some(part) = slot else {
                return Err(StoreError::PartNotUploadedYet(i));
            };
            if part.hash != part_hashes[i] {
                return Err(StoreError::PartHashMismatch(i));
            }
            if !part.complete {
                return Err(StoreError::PartNotUploadedYet(i));
            }
            // Only the truly last part escapes the minimum.
            if i + 1 < doc.parts.len() && part.size < self.limits.min_part_size {
                return Err(StoreError::PartTooSmall {
                    part: i,
                    min: self.limits.min_part_size,
                    size: part.size,
                });
            }
            sizes.push(part.size);
        }

        let overall = self.hash_concatenation(part_hashes).await?;

        match self.registry.set_hash(id, &overall).await {
            Ok(()) => {}
            Err(RegistryError::NotFound(_)) => return Err(StoreError::UploadExpiredOrRemoved),
            Err(e) => return Err(e.into()),
        }

        debug!("Finished upload {} ({} parts)", id, part_hashes.len());
        Ok((
            MultipartIndex {
                sizes,
                hashes: part_hashes.to_vec(),
            },
            overall,
        ))
    }

    /// Stream the named blobs in order through the canonical hasher. A blob
    /// vanishing mid-stream means the upload was removed concurrently.
    async fn hash_concatenation(&self, part_hashes: &[String]) -> Result<String, StoreError> {
        let mut hasher = hash::new_hasher();
        let mut buf = vec![0u8; hash::COPY_BUF_SIZE];
        for part_hash in part_hashes {
            let (mut reader, _) = match self.backend.get(part_hash).await {
                Ok(opened) => opened,
                Err(StorageError::NotFound(_)) => return Err(StoreError::UploadExpiredOrRemoved),
                Err(e) => return Err(e.into()),
            };
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(n) => n,
                    Err(StorageError::NotFound(_)) => {
                        return Err(StoreError::UploadExpiredOrRemoved)
                    }
                    Err(e) => return Err(e.into()),
                };
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let _ = reader.close().await;
        }
        Ok(hash::hex_digest(hasher))
    }
}

/// Validate the claimed offset of the incoming part and, now that its size
/// is declared, the stored offsets of any later parts that become
/// checkable. Checks are deferred while earlier parts are unknown.
fn check_offsets(
    doc: &UploadDoc,
    part_idx: usize,
    size: u64,
    offset: u64,
) -> Result<(), StoreError> {
    let mut expected = Some(0u64);
    for j in 0..part_idx {
        match doc.parts.get(j).and_then(|slot| slot.as_ref()) {
            Some(part) => expected = expected.map(|e| e + part.size),
            None => {
                expected = None;
                break;
            }
        }
    }

    if let Some(expected) = expected {
        if offset != expected {
            return Err(StoreError::PartWrongOffset {
                part: part_idx,
                expected,
                got: offset,
            });
        }
    }

    let Some(expected) = expected else {
        return Ok(());
    };
    let mut running = expected + size;
    for k in (part_idx + 1)..doc.parts.len() {
        match &doc.parts[k] {
            Some(later) => {
                if later.offset != running {
                    return Err(StoreError::PartWrongOffset {
                        part: k,
                        expected: running,
                        got: later.offset,
                    });
                }
                running += later.size;
            }
            // A hole defers the remaining checks until it fills.
            None => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UploadPart;
    use chrono::Utc;

    fn doc_with(parts: Vec<Option<UploadPart>>) -> UploadDoc {
        UploadDoc {
            id: "u".into(),
            expires: Utc::now(),
            hash: None,
            owner: None,
            parts,
        }
    }

    fn part(hash: &str, size: u64, offset: u64) -> Option<UploadPart> {
        Some(UploadPart {
            hash: hash.to_string(),
            size,
            offset,
            complete: true,
        })
    }

    #[test]
    fn test_offset_checked_against_known_predecessors() {
        let doc = doc_with(vec![part("h0", 20, 0)]);
        assert!(check_offsets(&doc, 1, 26, 20).is_ok());

        let err = check_offsets(&doc, 1, 26, 22).unwrap_err();
        assert_eq!(err.to_string(), "part 1 should start at 20 not at 22");
    }

    #[test]
    fn test_offset_check_deferred_until_predecessor_known() {
        // Part 1 arrives first; nothing to validate against yet.
        let doc = doc_with(vec![]);
        assert!(check_offsets(&doc, 1, 26, 22).is_ok());
    }

    #[test]
    fn test_deferred_offset_fires_when_earlier_part_lands() {
        let doc = doc_with(vec![None, part("h1", 26, 22)]);
        let err = check_offsets(&doc, 0, 20, 0).unwrap_err();
        assert_eq!(err.to_string(), "part 1 should start at 20 not at 22");
    }

    #[test]
    fn test_deferred_offset_accepts_consistent_layout() {
        let doc = doc_with(vec![None, part("h1", 26, 20)]);
        assert!(check_offsets(&doc, 0, 20, 0).is_ok());
    }

    #[test]
    fn test_holes_between_later_parts_stop_validation() {
        let doc = doc_with(vec![None, None, part("h2", 26, 999)]);
        // Part 1 is still a hole, so part 2's offset is not yet checkable.
        assert!(check_offsets(&doc, 0, 20, 0).is_ok());
    }
}
