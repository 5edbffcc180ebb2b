//! The blob store: deduplicating content-addressed storage plus the
//! multipart-upload state machine layered on a backend and a registry.

pub mod error;
pub mod lifecycle;
pub mod reader;
pub mod upload;

pub use error::StoreError;
pub use lifecycle::OwnershipCheck;
pub use reader::MultiReader;

use crate::config::{Config, UploadLimits};
use crate::hash;
use crate::registry::{SqliteRegistry, UploadRegistry};
use crate::storage::{self, Backend, BlobRead, StorageError};
use crate::types::{MultipartIndex, UploadDoc};
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::debug;

/// Content-addressed blob store with resumable multipart upload.
///
/// All operations may be invoked concurrently from any number of tasks
/// against the same instance; serialization happens in the registry's
/// conditional updates and through content-addressed naming, never through
/// an in-memory lock.
pub struct BlobStore {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) registry: Arc<dyn UploadRegistry>,
    pub(crate) limits: UploadLimits,
}

impl BlobStore {
    /// Assemble a store from already-built components.
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<dyn UploadRegistry>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            backend,
            registry,
            limits,
        }
    }

    /// Build the configured backend and registry and assemble the store.
    pub async fn from_config(config: &Config) -> Result<Self, StoreError> {
        let backend = storage::from_config(config).await?;
        let registry = Arc::new(
            SqliteRegistry::open(&config.registry_path, &config.collection_prefix).await?,
        );
        Ok(Self::new(backend, registry, config.limits))
    }

    /// Store a whole blob under the name derived from its content. The
    /// store is idempotent under re-puts of the same content.
    pub async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        hash: &str,
    ) -> Result<(), StoreError> {
        if !hash::is_plausible(hash) {
            return Err(StoreError::ImplausibleHash(hash.to_string()));
        }
        match self.backend.put(hash, reader, size, hash).await {
            Ok(()) => Ok(()),
            Err(e @ StorageError::HashMismatch { .. }) => {
                Err(StoreError::HashMismatch(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open a blob for reading. With an index, the returned reader presents
    /// the logical concatenation of the indexed parts; without one it is a
    /// plain single-blob read. Also returns the total size.
    pub async fn open(
        &self,
        name: &str,
        index: Option<&MultipartIndex>,
    ) -> Result<(Box<dyn BlobRead>, u64), StoreError> {
        match index {
            Some(index) => {
                let reader = MultiReader::new(Arc::clone(&self.backend), index.clone());
                let size = reader.total_size();
                Ok((Box::new(reader), size))
            }
            None => {
                if !hash::is_plausible(name) {
                    return Err(StoreError::ImplausibleHash(name.to_string()));
                }
                Ok(self.backend.get(name).await?)
            }
        }
    }

    /// Create a new multipart upload that expires at `expires` unless
    /// finished and owned before then. Returns the upload id.
    pub async fn new_upload(&self, expires: DateTime<Utc>) -> Result<String, StoreError> {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let id = hex::encode(raw);

        self.registry
            .insert(UploadDoc {
                id: id.clone(),
                expires,
                hash: None,
                owner: None,
                parts: Vec::new(),
            })
            .await?;
        debug!("Created upload {}", id);
        Ok(id)
    }

    /// The current state of an upload: its parts, hash and expiry.
    pub async fn upload_info(&self, id: &str) -> Result<UploadDoc, StoreError> {
        Ok(self.registry.get(id).await?)
    }
}
