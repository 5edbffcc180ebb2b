//! In-memory upload registry
//!
//! Same conditional semantics as the persistent registry, held under one
//! `RwLock`. Uploads are ephemeral and lost on restart; used by tests and
//! by embedders that do not need resumability across processes.

use super::{RegistryError, UploadRegistry};
use crate::types::{UploadDoc, UploadPart};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Thread-safe in-memory store for upload documents
#[derive(Default)]
pub struct MemoryRegistry {
    uploads: RwLock<HashMap<String, UploadDoc>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Grow `parts` so that `part` is a valid index.
fn ensure_slot(parts: &mut Vec<Option<UploadPart>>, part: usize) {
    if parts.len() <= part {
        parts.resize(part + 1, None);
    }
}

#[async_trait]
impl UploadRegistry for MemoryRegistry {
    async fn insert(&self, doc: UploadDoc) -> Result<(), RegistryError> {
        let mut uploads = self.uploads.write();
        if uploads.contains_key(&doc.id) {
            return Err(RegistryError::Database(format!(
                "upload {} already exists",
                doc.id
            )));
        }
        uploads.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<UploadDoc, RegistryError> {
        self.uploads
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn init_part(
        &self,
        id: &str,
        part: usize,
        hash: &str,
        size: u64,
        offset: u64,
    ) -> Result<(), RegistryError> {
        let mut uploads = self.uploads.write();
        let doc = uploads
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        ensure_slot(&mut doc.parts, part);
        if doc.parts[part].is_some() {
            return Err(RegistryError::PartTaken {
                id: id.to_string(),
                part,
            });
        }
        doc.parts[part] = Some(UploadPart {
            hash: hash.to_string(),
            size,
            offset,
            complete: false,
        });
        Ok(())
    }

    async fn complete_part(
        &self,
        id: &str,
        part: usize,
        hash: &str,
        size: u64,
        offset: u64,
    ) -> Result<(), RegistryError> {
        let mut uploads = self.uploads.write();
        let doc = uploads
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        ensure_slot(&mut doc.parts, part);
        doc.parts[part] = Some(UploadPart {
            hash: hash.to_string(),
            size,
            offset,
            complete: true,
        });
        Ok(())
    }

    async fn set_hash(&self, id: &str, hash: &str) -> Result<(), RegistryError> {
        let mut uploads = self.uploads.write();
        let doc = uploads
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        match &doc.hash {
            None => {
                doc.hash = Some(hash.to_string());
                Ok(())
            }
            Some(existing) if existing == hash => Ok(()),
            Some(_) => Err(RegistryError::HashConflict(id.to_string())),
        }
    }

    async fn set_owner(
        &self,
        id: &str,
        owner: &str,
        expires: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut uploads = self.uploads.write();
        let doc = uploads
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if doc.hash.is_none() {
            return Err(RegistryError::NotFinished(id.to_string()));
        }
        if let Some(existing) = &doc.owner {
            if existing != owner {
                return Err(RegistryError::OwnerMismatch {
                    id: id.to_string(),
                    owner: existing.clone(),
                });
            }
        }
        doc.owner = Some(owner.to_string());
        doc.expires = expires;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        self.uploads.write().remove(id);
        Ok(())
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadDoc>, RegistryError> {
        Ok(self
            .uploads
            .read()
            .values()
            .filter(|doc| doc.expires < now)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<UploadDoc>, RegistryError> {
        Ok(self.uploads.read().values().cloned().collect())
    }
}
