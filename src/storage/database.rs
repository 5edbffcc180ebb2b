//! Database-embedded storage backend
//!
//! Blobs are split into fixed-size chunk rows inside the same embedded
//! database that holds the upload metadata, so deployments without an
//! object store keep blob writes transactionally co-located with their
//! documents. In-flight writes stream into chunk rows under a reserved
//! staging name; the blob row that `get` resolves appears only after the
//! content hash has been verified, inside one transaction.

use super::traits::{Backend, BlobInfo, BlobRead, StorageError};
use crate::hash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::Digest;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

/// Bytes per chunk row.
const CHUNK_SIZE: usize = 256 * 1024;

/// Database-embedded storage backend
pub struct DatabaseBackend {
    conn: Arc<Mutex<Connection>>,
    blobs_table: String,
    chunks_table: String,
}

impl DatabaseBackend {
    /// Open (or create) the backing database file.
    pub async fn open(path: &Path, prefix: &str) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || Connection::open(path))
            .await
            .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))?
            .map_err(db_err)?;
        Self::with_connection(Arc::new(Mutex::new(conn)), prefix).await
    }

    /// Build on an existing connection, e.g. the one the upload registry
    /// uses, so blobs and metadata share a database file.
    pub async fn with_connection(
        conn: Arc<Mutex<Connection>>,
        prefix: &str,
    ) -> Result<Self, StorageError> {
        let backend = Self {
            conn,
            blobs_table: format!("{}_blobs", prefix),
            chunks_table: format!("{}_chunks", prefix),
        };
        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {blobs} (
                name TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {chunks} (
                name TEXT NOT NULL,
                seq INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (name, seq)
            );",
            blobs = backend.blobs_table,
            chunks = backend.chunks_table,
        );
        backend
            .with_conn(move |conn| conn.execute_batch(&schema).map_err(db_err))
            .await?;
        Ok(backend)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))?
    }

    /// Delete every chunk row stored under `name` (staging or final).
    async fn delete_chunks(&self, name: String) -> Result<(), StorageError> {
        let sql = format!("DELETE FROM {} WHERE name = ?1", self.chunks_table);
        self.with_conn(move |conn| {
            conn.execute(&sql, params![name]).map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

#[async_trait]
impl Backend for DatabaseBackend {
    #[instrument(skip(self, reader))]
    async fn put(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        hash: &str,
    ) -> Result<(), StorageError> {
        // Blob names are hex, so the "tmp:" namespace cannot collide.
        let staging = format!("tmp:{}:{:016x}", name, rand::random::<u64>());

        let result = match self.stream_to_staging(&staging, reader, size, hash).await {
            Ok(()) => self.publish(&staging, name, size).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            let _ = self.delete_chunks(staging).await;
            return Err(e);
        }
        debug!("Wrote blob {} ({} bytes)", name, size);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<(Box<dyn BlobRead>, u64), StorageError> {
        let sql = format!("SELECT size FROM {} WHERE name = ?1", self.blobs_table);
        let lookup = name.to_string();
        let size: Option<u64> = self
            .with_conn(move |conn| {
                conn.query_row(&sql, params![lookup], |row| row.get::<_, i64>(0))
                    .optional()
                    .map_err(db_err)
            })
            .await?
            .map(|s| s as u64);
        let Some(size) = size else {
            return Err(StorageError::NotFound(name.to_string()));
        };
        debug!("Opened blob {} ({} bytes)", name, size);
        let reader = DbBlobRead {
            conn: Arc::clone(&self.conn),
            chunks_table: self.chunks_table.clone(),
            name: name.to_string(),
            size,
            pos: 0,
            cached: None,
        };
        Ok((Box::new(reader), size))
    }

    #[instrument(skip(self))]
    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        let blobs = self.blobs_table.clone();
        let chunks = self.chunks_table.clone();
        let target = name.to_string();
        let removed = self
            .with_conn(move |conn| {
                let tx = conn.transaction().map_err(db_err)?;
                let n = tx
                    .execute(
                        &format!("DELETE FROM {} WHERE name = ?1", blobs),
                        params![target],
                    )
                    .map_err(db_err)?;
                tx.execute(
                    &format!("DELETE FROM {} WHERE name = ?1", chunks),
                    params![target],
                )
                .map_err(db_err)?;
                tx.commit().map_err(db_err)?;
                Ok(n)
            })
            .await?;
        if removed == 0 {
            return Err(StorageError::NotFound(name.to_string()));
        }
        debug!("Deleted blob {}", name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<BlobInfo>, StorageError> {
        let sql = format!(
            "SELECT name, size, created_at FROM {} ORDER BY name",
            self.blobs_table
        );
        let blobs = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(db_err)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)? as u64,
                            row.get::<_, i64>(2)?,
                        ))
                    })
                    .map_err(db_err)?;
                let mut out = Vec::new();
                for row in rows {
                    let (name, size, micros) = row.map_err(db_err)?;
                    out.push(BlobInfo {
                        name,
                        size,
                        created_at: DateTime::from_timestamp_micros(micros)
                            .unwrap_or_else(Utc::now),
                    });
                }
                Ok(out)
            })
            .await?;
        debug!("Listed {} blobs", blobs.len());
        Ok(blobs)
    }
}

impl DatabaseBackend {
    /// Stream the body into chunk rows under the staging name, verifying
    /// the hash as the bytes pass through.
    async fn stream_to_staging(
        &self,
        staging: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
        want: &str,
    ) -> Result<(), StorageError> {
        let insert = format!(
            "INSERT INTO {} (name, seq, data) VALUES (?1, ?2, ?3)",
            self.chunks_table
        );
        let mut hasher = hash::new_hasher();
        let mut remaining = size;
        let mut seq: i64 = 0;

        while remaining > 0 {
            let want_len = CHUNK_SIZE.min(remaining as usize);
            let mut chunk = vec![0u8; want_len];
            let mut filled = 0;
            while filled < want_len {
                let n = reader.read(&mut chunk[filled..]).await?;
                if n == 0 {
                    return Err(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("blob body ended {} bytes early", remaining - filled as u64),
                    )));
                }
                filled += n;
            }
            hasher.update(&chunk);
            remaining -= want_len as u64;

            let sql = insert.clone();
            let name = staging.to_string();
            self.with_conn(move |conn| {
                conn.execute(&sql, params![name, seq, chunk]).map_err(db_err)?;
                Ok(())
            })
            .await?;
            seq += 1;
        }

        let got = hash::hex_digest(hasher);
        if got != want {
            return Err(StorageError::HashMismatch {
                name: want.to_string(),
                got,
            });
        }
        Ok(())
    }

    /// Atomically replace any previous blob under `name` with the staged
    /// chunks and create the blob row that makes it visible.
    async fn publish(&self, staging: &str, name: &str, size: u64) -> Result<(), StorageError> {
        let blobs = self.blobs_table.clone();
        let chunks = self.chunks_table.clone();
        let staging = staging.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            tx.execute(
                &format!("DELETE FROM {} WHERE name = ?1", chunks),
                params![name],
            )
            .map_err(db_err)?;
            tx.execute(
                &format!("DELETE FROM {} WHERE name = ?1", blobs),
                params![name],
            )
            .map_err(db_err)?;
            tx.execute(
                &format!("UPDATE {} SET name = ?1 WHERE name = ?2", chunks),
                params![name, staging],
            )
            .map_err(db_err)?;
            tx.execute(
                &format!(
                    "INSERT INTO {} (name, size, created_at) VALUES (?1, ?2, ?3)",
                    blobs
                ),
                params![name, size as i64, Utc::now().timestamp_micros()],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

/// Random-access handle that fetches chunk rows on demand, caching the one
/// the read position currently falls in.
struct DbBlobRead {
    conn: Arc<Mutex<Connection>>,
    chunks_table: String,
    name: String,
    size: u64,
    pos: u64,
    cached: Option<(i64, Vec<u8>)>,
}

impl std::fmt::Debug for DbBlobRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbBlobRead")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}

impl DbBlobRead {
    async fn fetch_chunk(&self, seq: i64) -> Result<Vec<u8>, StorageError> {
        let sql = format!(
            "SELECT data FROM {} WHERE name = ?1 AND seq = ?2",
            self.chunks_table
        );
        let name = self.name.clone();
        let conn = Arc::clone(&self.conn);
        let chunk: Option<Vec<u8>> = tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            guard
                .query_row(&sql, params![name, seq], |row| row.get(0))
                .optional()
                .map_err(db_err)
        })
        .await
        .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))??;
        chunk.ok_or_else(|| StorageError::NotFound(format!("{} chunk {}", self.name, seq)))
    }
}

#[async_trait]
impl BlobRead for DbBlobRead {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let seq = (self.pos / CHUNK_SIZE as u64) as i64;
        if self.cached.as_ref().map(|(s, _)| *s) != Some(seq) {
            let chunk = self.fetch_chunk(seq).await?;
            self.cached = Some((seq, chunk));
        }
        let Some((_, chunk)) = self.cached.as_ref() else {
            return Err(StorageError::Other("chunk cache invariant violated".into()));
        };
        let within = (self.pos % CHUNK_SIZE as u64) as usize;
        let n = buf.len().min(chunk.len().saturating_sub(within));
        if n == 0 {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("blob {} shorter than its recorded size", self.name),
            )));
        }
        buf[..n].copy_from_slice(&chunk[within..within + n]);
        self.pos += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.size as i64 + delta,
        };
        if target < 0 {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            )));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.cached = None;
        Ok(())
    }
}
