//! Embedded-database upload registry
//!
//! One row per upload document: `id, expires, hash, owner` as columns plus
//! the parts array as a JSON document, in a table named by the configured
//! collection prefix. Every conditional operation runs its precondition and
//! its write inside one immediate transaction; that transaction is the
//! store's lock-free serialization point for racing part initializers.

use super::{RegistryError, UploadRegistry};
use crate::types::{UploadDoc, UploadPart};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Persistent upload registry backed by an embedded database file
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteRegistry {
    /// Open (or create) the registry in the given database file.
    pub async fn open(path: &Path, prefix: &str) -> Result<Self, RegistryError> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || Connection::open(path))
            .await
            .map_err(|e| RegistryError::Database(format!("spawn_blocking join failed: {}", e)))??;
        Self::init(Arc::new(Mutex::new(conn)), prefix).await
    }

    /// Open a registry that lives only as long as the process. Useful for
    /// tests and ephemeral embedders.
    pub async fn open_in_memory(prefix: &str) -> Result<Self, RegistryError> {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(|e| RegistryError::Database(format!("spawn_blocking join failed: {}", e)))??;
        Self::init(Arc::new(Mutex::new(conn)), prefix).await
    }

    async fn init(conn: Arc<Mutex<Connection>>, prefix: &str) -> Result<Self, RegistryError> {
        let registry = Self {
            conn,
            table: format!("{}_uploads", prefix),
        };
        let schema = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                expires INTEGER NOT NULL,
                hash TEXT,
                owner TEXT,
                parts TEXT NOT NULL
            )",
            registry.table
        );
        registry
            .with_conn(move |conn| {
                conn.execute_batch(&schema)?;
                Ok(())
            })
            .await?;
        debug!("Upload registry ready (table {})", registry.table);
        Ok(registry)
    }

    /// The underlying connection, for co-locating the database-embedded
    /// blob backend in the same file.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Connection) -> Result<T, RegistryError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| RegistryError::Database(format!("spawn_blocking join failed: {}", e)))?
    }

    /// Run `mutate` on the current document inside one immediate
    /// transaction, writing the document back if it returns `Ok`.
    async fn mutate_doc<F>(&self, id: &str, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut UploadDoc) -> Result<(), RegistryError> + Send + 'static,
    {
        let table = self.table.clone();
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut doc =
                read_doc(&tx, &table, &id)?.ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            mutate(&mut doc)?;
            write_doc(&tx, &table, &doc)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn read_doc(
    conn: &Connection,
    table: &str,
    id: &str,
) -> Result<Option<UploadDoc>, RegistryError> {
    let sql = format!(
        "SELECT expires, hash, owner, parts FROM {} WHERE id = ?1",
        table
    );
    let row = conn
        .query_row(&sql, params![id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .optional()?;
    let Some((expires, hash, owner, parts)) = row else {
        return Ok(None);
    };
    let parts: Vec<Option<UploadPart>> = serde_json::from_str(&parts)?;
    Ok(Some(UploadDoc {
        id: id.to_string(),
        expires: DateTime::from_timestamp_micros(expires)
            .ok_or_else(|| RegistryError::Database(format!("bad expiry for upload {}", id)))?,
        hash,
        owner,
        parts,
    }))
}

fn write_doc(conn: &Connection, table: &str, doc: &UploadDoc) -> Result<(), RegistryError> {
    let sql = format!(
        "UPDATE {} SET expires = ?2, hash = ?3, owner = ?4, parts = ?5 WHERE id = ?1",
        table
    );
    conn.execute(
        &sql,
        params![
            doc.id,
            doc.expires.timestamp_micros(),
            doc.hash,
            doc.owner,
            serde_json::to_string(&doc.parts)?,
        ],
    )?;
    Ok(())
}

/// Grow `parts` so that `part` is a valid index.
fn ensure_slot(parts: &mut Vec<Option<UploadPart>>, part: usize) {
    if parts.len() <= part {
        parts.resize(part + 1, None);
    }
}

#[async_trait]
impl UploadRegistry for SqliteRegistry {
    async fn insert(&self, doc: UploadDoc) -> Result<(), RegistryError> {
        let table = self.table.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT INTO {} (id, expires, hash, owner, parts) VALUES (?1, ?2, ?3, ?4, ?5)",
                table
            );
            conn.execute(
                &sql,
                params![
                    doc.id,
                    doc.expires.timestamp_micros(),
                    doc.hash,
                    doc.owner,
                    serde_json::to_string(&doc.parts)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<UploadDoc, RegistryError> {
        let table = self.table.clone();
        let lookup = id.to_string();
        self.with_conn(move |conn| {
            read_doc(conn, &table, &lookup)?.ok_or(RegistryError::NotFound(lookup))
        })
        .await
    }

    async fn init_part(
        &self,
        id: &str,
        part: usize,
        hash: &str,
        size: u64,
        offset: u64,
    ) -> Result<(), RegistryError> {
        let upload = id.to_string();
        let hash = hash.to_string();
        self.mutate_doc(id, move |doc| {
            ensure_slot(&mut doc.parts, part);
            if doc.parts[part].is_some() {
                return Err(RegistryError::PartTaken { id: upload, part });
            }
            doc.parts[part] = Some(UploadPart {
                hash,
                size,
                offset,
                complete: false,
            });
            Ok(())
        })
        .await
    }

    async fn complete_part(
        &self,
        id: &str,
        part: usize,
        hash: &str,
        size: u64,
        offset: u64,
    ) -> Result<(), RegistryError> {
        let hash = hash.to_string();
        self.mutate_doc(id, move |doc| {
            ensure_slot(&mut doc.parts, part);
            doc.parts[part] = Some(UploadPart {
                hash,
                size,
                offset,
                complete: true,
            });
            Ok(())
        })
        .await
    }

    async fn set_hash(&self, id: &str, hash: &str) -> Result<(), RegistryError> {
        let upload = id.to_string();
        let hash = hash.to_string();
        self.mutate_doc(id, move |doc| match &doc.hash {
            None => {
                doc.hash = Some(hash);
                Ok(())
            }
            Some(existing) if *existing == hash => Ok(()),
            Some(_) => Err(RegistryError::HashConflict(upload)),
        })
        .await
    }

    async fn set_owner(
        &self,
        id: &str,
        owner: &str,
        expires: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let upload = id.to_string();
        let owner = owner.to_string();
        self.mutate_doc(id, move |doc| {
            if doc.hash.is_none() {
                return Err(RegistryError::NotFinished(upload));
            }
            if let Some(existing) = &doc.owner {
                if *existing != owner {
                    return Err(RegistryError::OwnerMismatch {
                        id: upload,
                        owner: existing.clone(),
                    });
                }
            }
            doc.owner = Some(owner);
            doc.expires = expires;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let table = self.table.clone();
        let target = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("DELETE FROM {} WHERE id = ?1", table);
            conn.execute(&sql, params![target])?;
            Ok(())
        })
        .await
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadDoc>, RegistryError> {
        let table = self.table.clone();
        self.with_conn(move |conn| {
            let sql = format!("SELECT id FROM {} WHERE expires < ?1", table);
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map(params![now.timestamp_micros()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            let mut docs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(doc) = read_doc(conn, &table, &id)? {
                    docs.push(doc);
                }
            }
            Ok(docs)
        })
        .await
    }

    async fn all(&self) -> Result<Vec<UploadDoc>, RegistryError> {
        let table = self.table.clone();
        self.with_conn(move |conn| {
            let sql = format!("SELECT id FROM {} ORDER BY id", table);
            let mut stmt = conn.prepare(&sql)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            let mut docs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(doc) = read_doc(conn, &table, &id)? {
                    docs.push(doc);
                }
            }
            Ok(docs)
        })
        .await
    }
}
