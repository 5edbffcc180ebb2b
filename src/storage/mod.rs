//! Storage backends for blob bytes

pub mod database;
pub mod filesystem;
pub mod s3;
pub mod traits;

pub use database::DatabaseBackend;
pub use filesystem::FilesystemBackend;
pub use s3::S3Backend;
pub use traits::{Backend, BlobInfo, BlobRead, StorageError};

use crate::config::{BackendConfig, Config};
use std::sync::Arc;

/// Build the configured backend. Unknown backend types never reach this
/// point; they fail configuration parsing.
pub async fn from_config(config: &Config) -> Result<Arc<dyn Backend>, StorageError> {
    match &config.backend {
        BackendConfig::Filesystem { path } => {
            Ok(Arc::new(FilesystemBackend::new(path.clone()).await?))
        }
        BackendConfig::Database { path } => {
            let path = path.clone().unwrap_or_else(|| config.registry_path.clone());
            Ok(Arc::new(
                DatabaseBackend::open(&path, &config.collection_prefix).await?,
            ))
        }
        s3 @ BackendConfig::S3 { .. } => Ok(Arc::new(S3Backend::new(s3).await?)),
    }
}
