//! The blob engine (`spec.md` §4.6).
//!
//! Blobs are raw bytes keyed by `(app_id, path)`, with a declared MIME type
//! and a SHA-256 content hash recomputed on every write. Path
//! normalization (strip leading `/`, collapse repeated `/`) is idempotent
//! and applied before every read and write, so callers never need to
//! normalize themselves.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};

use crate::context::OpContext;
use crate::error::StorageError;
use crate::queue::WriteQueue;
use crate::substrate::Substrate;
use crate::time::now_millis;

/// Metadata for a stored blob, without its bytes.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub path: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub hash: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A stored blob's bytes plus metadata.
#[derive(Debug, Clone)]
pub struct Blob {
    pub meta: BlobMeta,
    pub data: Vec<u8>,
}

/// Strips leading `/` and collapses runs of `/` into one, per `spec.md`
/// §4.6. Idempotent: `normalize_path(normalize_path(p)) == normalize_path(p)`.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if last_was_slash {
                continue;
            }
            last_was_slash = true;
        } else {
            last_was_slash = false;
        }
        out.push(ch);
    }
    out.trim_start_matches('/').to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The blob engine over a shared substrate and write queue.
pub struct BlobEngine {
    substrate: Arc<Substrate>,
    queue: Arc<WriteQueue>,
}

impl BlobEngine {
    pub fn new(substrate: Arc<Substrate>, queue: Arc<WriteQueue>) -> Self {
        Self { substrate, queue }
    }

    /// Upserts `(app, path) -> bytes`, recomputing the hash and size.
    pub fn put(&self, ctx: &OpContext, app: &str, path: &str, bytes: Vec<u8>, mime: &str) -> Result<(), StorageError> {
        let path = normalize_path(path);
        let app = app.to_string();
        let mime = mime.to_string();
        let hash = sha256_hex(&bytes);
        let size = bytes.len() as i64;
        let now = now_millis();

        self.queue.submit(ctx, move |substrate| {
            let ctx = OpContext::background();
            substrate.with_retry(&ctx, |conn| {
                conn.execute(
                    "INSERT INTO app_blobs (app_id, path, data, mime_type, size_bytes, hash, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     ON CONFLICT(app_id, path) DO UPDATE SET
                        data = excluded.data,
                        mime_type = excluded.mime_type,
                        size_bytes = excluded.size_bytes,
                        hash = excluded.hash,
                        updated_at = excluded.updated_at",
                    rusqlite::params![app, path, bytes, mime, size, hash, now],
                )?;
                Ok(())
            })
        })
    }

    /// Returns the blob's bytes and metadata, or `None` if absent.
    pub fn get(&self, ctx: &OpContext, app: &str, path: &str) -> Result<Option<Blob>, StorageError> {
        let path = normalize_path(path);
        self.substrate.with_retry(ctx, |conn| {
            conn.query_row(
                "SELECT data, mime_type, size_bytes, hash, created_at, updated_at
                 FROM app_blobs WHERE app_id = ?1 AND path = ?2",
                rusqlite::params![app, path],
                |row| {
                    Ok(Blob {
                        meta: BlobMeta {
                            path: path.clone(),
                            mime_type: row.get(1)?,
                            size_bytes: row.get(2)?,
                            hash: row.get(3)?,
                            created_at: row.get(4)?,
                            updated_at: row.get(5)?,
                        },
                        data: row.get(0)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Returns only the blob's metadata, without loading its bytes.
    pub fn get_meta(&self, ctx: &OpContext, app: &str, path: &str) -> Result<Option<BlobMeta>, StorageError> {
        let path = normalize_path(path);
        self.substrate.with_retry(ctx, |conn| {
            conn.query_row(
                "SELECT mime_type, size_bytes, hash, created_at, updated_at
                 FROM app_blobs WHERE app_id = ?1 AND path = ?2",
                rusqlite::params![app, path],
                |row| {
                    Ok(BlobMeta {
                        path: path.clone(),
                        mime_type: row.get(0)?,
                        size_bytes: row.get(1)?,
                        hash: row.get(2)?,
                        created_at: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn exists(&self, ctx: &OpContext, app: &str, path: &str) -> Result<bool, StorageError> {
        Ok(self.get_meta(ctx, app, path)?.is_some())
    }

    /// Removes the blob at `(app, path)`.
    pub fn delete(&self, ctx: &OpContext, app: &str, path: &str) -> Result<(), StorageError> {
        let path = normalize_path(path);
        let app = app.to_string();
        self.queue.submit(ctx, move |substrate| {
            let ctx = OpContext::background();
            substrate.with_retry(&ctx, |conn| {
                conn.execute("DELETE FROM app_blobs WHERE app_id = ?1 AND path = ?2", rusqlite::params![app, path])?;
                Ok(())
            })
        })
    }

    /// Lists blob metadata under `prefix`, ordered by path.
    pub fn list(&self, ctx: &OpContext, app: &str, prefix: &str) -> Result<Vec<BlobMeta>, StorageError> {
        let prefix = normalize_path(prefix);
        let like_pattern = format!("{}%", escape_like(&prefix));
        self.substrate.with_retry(ctx, |conn| {
            let mut stmt = conn.prepare(
                "SELECT path, mime_type, size_bytes, hash, created_at, updated_at
                 FROM app_blobs WHERE app_id = ?1 AND path LIKE ?2 ESCAPE '\\'
                 ORDER BY path ASC",
            )?;
            stmt.query_map(rusqlite::params![app, like_pattern], |row| {
                Ok(BlobMeta {
                    path: row.get(0)?,
                    mime_type: row.get(1)?,
                    size_bytes: row.get(2)?,
                    hash: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
        })
    }

    /// Copies `src` to `dst`, preserving hash and MIME type. Fails with
    /// `NotFound` if `src` is absent, per `spec.md` §4.6.
    pub fn copy(&self, ctx: &OpContext, app: &str, src: &str, dst: &str) -> Result<(), StorageError> {
        let source = self
            .get(ctx, app, src)?
            .ok_or_else(|| StorageError::NotFound(format!("blob {src} not found")))?;
        self.put(ctx, app, dst, source.data, &source.meta.mime_type)
    }

    /// `Move = Copy + Delete(src)`, per `spec.md` §4.6.
    pub fn move_blob(&self, ctx: &OpContext, app: &str, src: &str, dst: &str) -> Result<(), StorageError> {
        self.copy(ctx, app, src, dst)?;
        self.delete(ctx, app, src)
    }

    /// Sums the size of every blob belonging to `app`.
    pub fn total_size(&self, ctx: &OpContext, app: &str) -> Result<i64, StorageError> {
        self.substrate.with_retry(ctx, |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM app_blobs WHERE app_id = ?1",
                rusqlite::params![app],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
