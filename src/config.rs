//! Configuration for the blob store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Path of the embedded metadata database holding upload documents
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Prefix for the metadata tables (the "collection" name)
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,

    /// Multipart upload limits
    #[serde(default)]
    pub limits: UploadLimits,
}

/// Multipart upload limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UploadLimits {
    /// Minimum bytes for any non-tail part
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,

    /// Ceiling for any single part
    #[serde(default = "default_max_part_size")]
    pub max_part_size: u64,

    /// Upper bound on the part count of one upload
    #[serde(default = "default_max_parts")]
    pub max_parts: usize,
}

/// Storage backend configuration
///
/// Unknown `type` values fail to deserialize, so a misconfigured backend is
/// fatal at startup rather than at first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Filesystem backend for local storage/development
    Filesystem {
        /// Directory for blob storage
        path: PathBuf,
    },

    /// Database-embedded backend: blobs chunked into the same embedded
    /// database that holds upload metadata
    Database {
        /// Database file; defaults to `registry_path` so blob writes are
        /// co-located with metadata
        #[serde(default)]
        path: Option<PathBuf>,
    },

    /// S3-compatible object store for production use
    S3 {
        /// Endpoint URL (for MinIO, LocalStack, or custom S3-compatible
        /// services). If not specified, uses the AWS default endpoint.
        #[serde(default)]
        endpoint: Option<String>,

        /// Bucket holding blob objects
        bucket: String,

        /// AWS region
        #[serde(default = "default_region")]
        region: String,

        /// Use path-style URLs (required for MinIO, LocalStack)
        #[serde(default = "default_force_path_style")]
        force_path_style: bool,

        /// AWS access key ID (optional, can use env/instance credentials)
        #[serde(default)]
        access_key_id: Option<String>,

        /// AWS secret access key (optional, can use env/instance credentials)
        #[serde(default)]
        secret_access_key: Option<String>,
    },
}

// Default value functions for serde
fn default_registry_path() -> PathBuf {
    PathBuf::from("./blobstore-meta.db")
}

fn default_collection_prefix() -> String {
    "blobstore".to_string()
}

fn default_min_part_size() -> u64 {
    5 * 1024 * 1024 // 5 MiB
}

fn default_max_part_size() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

fn default_max_parts() -> usize {
    400
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Filesystem {
            path: PathBuf::from("./data"),
        }
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            min_part_size: default_min_part_size(),
            max_part_size: default_max_part_size(),
            max_parts: default_max_parts(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            registry_path: default_registry_path(),
            collection_prefix: default_collection_prefix(),
            limits: UploadLimits::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables (legacy support)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("BLOBSTORE_REGISTRY_PATH") {
            config.registry_path = PathBuf::from(path);
        }

        if let Ok(prefix) = std::env::var("BLOBSTORE_COLLECTION_PREFIX") {
            config.collection_prefix = prefix;
        }

        // Backend selection: S3 wins if a bucket is named, then the embedded
        // database, then a filesystem directory.
        if let Ok(bucket) = std::env::var("BLOBSTORE_S3_BUCKET") {
            config.backend = BackendConfig::S3 {
                endpoint: std::env::var("BLOBSTORE_S3_ENDPOINT").ok(),
                bucket,
                region: std::env::var("BLOBSTORE_S3_REGION")
                    .unwrap_or_else(|_| default_region()),
                force_path_style: std::env::var("BLOBSTORE_S3_FORCE_PATH_STYLE")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
                access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            };
        } else if std::env::var("BLOBSTORE_BACKEND_DATABASE").is_ok() {
            config.backend = BackendConfig::Database {
                path: std::env::var("BLOBSTORE_BACKEND_DATABASE_PATH")
                    .ok()
                    .map(PathBuf::from),
            };
        } else if let Ok(dir) = std::env::var("BLOBSTORE_DATA_DIR") {
            config.backend = BackendConfig::Filesystem {
                path: PathBuf::from(dir),
            };
        }

        if let Ok(size) = std::env::var("BLOBSTORE_MIN_PART_SIZE") {
            if let Ok(parsed) = size.parse() {
                config.limits.min_part_size = parsed;
            }
        }

        if let Ok(size) = std::env::var("BLOBSTORE_MAX_PART_SIZE") {
            if let Ok(parsed) = size.parse() {
                config.limits.max_part_size = parsed;
            }
        }

        if let Ok(count) = std::env::var("BLOBSTORE_MAX_PARTS") {
            if let Ok(parsed) = count.parse() {
                config.limits.max_parts = parsed;
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load() -> Self {
        // Try config file first
        if let Ok(path) = std::env::var("BLOBSTORE_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        // Try default config file locations
        for path in &["blobstore.toml", "/etc/blobstore/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        // Fall back to environment variables
        Self::from_env()
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
