//! User-scoped wrappers (`spec.md` §4.7, scoping rule in §3).
//!
//! Each wrapper holds `(app_id, user_id)` and rewrites user-facing names on
//! the way into the underlying engine, and strips the scoping prefix back
//! out of listing results on the way back. A wrapper introduces no new
//! storage or cache; it is a thin decorator over the shared engine and
//! queue, per §4.7: "Wrappers do not add their own cache; they reuse the
//! underlying engine and queue."

use serde_json::{Map, Value};

use crate::blobs::{Blob, BlobEngine, BlobMeta};
use crate::context::OpContext;
use crate::documents::{DocumentEngine, FindOptions, QueryOrId};
use crate::error::StorageError;
use crate::kv::{KvEngine, KvEntry};

fn kv_key(user_id: &str, key: &str) -> String {
    format!("u:{user_id}:{key}")
}

fn doc_collection(user_id: &str, coll: &str) -> String {
    format!("u:{user_id}:{coll}")
}

fn blob_path(user_id: &str, path: &str) -> String {
    format!("u/{user_id}/{}", crate::blobs::normalize_path(path))
}

/// Strips a `u:<user_id>:` prefix back off a key, for listing results.
fn strip_kv_prefix<'a>(user_id: &str, scoped_key: &'a str) -> &'a str {
    scoped_key.strip_prefix(&format!("u:{user_id}:")).unwrap_or(scoped_key)
}

/// Strips a `u/<user_id>/` prefix back off a path, for listing results.
fn strip_blob_prefix<'a>(user_id: &str, scoped_path: &'a str) -> &'a str {
    scoped_path.strip_prefix(&format!("u/{user_id}/")).unwrap_or(scoped_path)
}

/// A user-scoped view over the KV engine.
pub struct ScopedKv<'a> {
    engine: &'a KvEngine,
    app_id: String,
    user_id: String,
}

impl<'a> ScopedKv<'a> {
    pub fn new(engine: &'a KvEngine, app_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            engine,
            app_id: app_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn set(&self, ctx: &OpContext, key: &str, value: Value, ttl_ms: Option<i64>) -> Result<(), StorageError> {
        self.engine.set(ctx, &self.app_id, &kv_key(&self.user_id, key), value, ttl_ms)
    }

    pub fn get(&self, ctx: &OpContext, key: &str) -> Result<Option<Value>, StorageError> {
        self.engine.get(ctx, &self.app_id, &kv_key(&self.user_id, key))
    }

    pub fn delete(&self, ctx: &OpContext, key: &str) -> Result<(), StorageError> {
        self.engine.delete(ctx, &self.app_id, &kv_key(&self.user_id, key))
    }

    pub fn list(&self, ctx: &OpContext, prefix: &str) -> Result<Vec<KvEntry>, StorageError> {
        let scoped_prefix = kv_key(&self.user_id, prefix);
        let entries = self.engine.list(ctx, &self.app_id, &scoped_prefix)?;
        Ok(entries
            .into_iter()
            .map(|entry| KvEntry {
                key: strip_kv_prefix(&self.user_id, &entry.key).to_string(),
                value: entry.value,
            })
            .collect())
    }
}

/// A user-scoped view over the document engine.
pub struct ScopedDocuments<'a> {
    engine: &'a DocumentEngine,
    app_id: String,
    user_id: String,
}

impl<'a> ScopedDocuments<'a> {
    pub fn new(engine: &'a DocumentEngine, app_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            engine,
            app_id: app_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn insert(&self, ctx: &OpContext, coll: &str, doc: Map<String, Value>) -> Result<String, StorageError> {
        self.engine.insert(ctx, &self.app_id, &doc_collection(&self.user_id, coll), doc)
    }

    pub fn find(&self, ctx: &OpContext, coll: &str, query: &Map<String, Value>) -> Result<Vec<Value>, StorageError> {
        self.engine.find(ctx, &self.app_id, &doc_collection(&self.user_id, coll), query)
    }

    pub fn find_with_options(
        &self,
        ctx: &OpContext,
        coll: &str,
        query: &Map<String, Value>,
        options: FindOptions,
    ) -> Result<Vec<Value>, StorageError> {
        self.engine
            .find_with_options(ctx, &self.app_id, &doc_collection(&self.user_id, coll), query, options)
    }

    pub fn find_one(&self, ctx: &OpContext, coll: &str, query_or_id: QueryOrId) -> Result<Option<Value>, StorageError> {
        self.engine.find_one(ctx, &self.app_id, &doc_collection(&self.user_id, coll), query_or_id)
    }

    pub fn update(
        &self,
        ctx: &OpContext,
        coll: &str,
        query: &Map<String, Value>,
        changes: &Map<String, Value>,
    ) -> Result<usize, StorageError> {
        self.engine
            .update(ctx, &self.app_id, &doc_collection(&self.user_id, coll), query, changes)
    }

    pub fn delete(&self, ctx: &OpContext, coll: &str, query: &Map<String, Value>) -> Result<usize, StorageError> {
        self.engine.delete(ctx, &self.app_id, &doc_collection(&self.user_id, coll), query)
    }

    pub fn count(&self, ctx: &OpContext, coll: &str, query: &Map<String, Value>) -> Result<i64, StorageError> {
        self.engine.count(ctx, &self.app_id, &doc_collection(&self.user_id, coll), query)
    }

    // deleteOldest is intentionally absent here: spec.md §4.9 reserves it
    // for the shared (non-user) scope only.
}

/// A user-scoped view over the blob engine.
pub struct ScopedBlobs<'a> {
    engine: &'a BlobEngine,
    app_id: String,
    user_id: String,
}

impl<'a> ScopedBlobs<'a> {
    pub fn new(engine: &'a BlobEngine, app_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            engine,
            app_id: app_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn put(&self, ctx: &OpContext, path: &str, bytes: Vec<u8>, mime: &str) -> Result<(), StorageError> {
        self.engine.put(ctx, &self.app_id, &blob_path(&self.user_id, path), bytes, mime)
    }

    pub fn get(&self, ctx: &OpContext, path: &str) -> Result<Option<Blob>, StorageError> {
        self.engine.get(ctx, &self.app_id, &blob_path(&self.user_id, path))
    }

    pub fn delete(&self, ctx: &OpContext, path: &str) -> Result<(), StorageError> {
        self.engine.delete(ctx, &self.app_id, &blob_path(&self.user_id, path))
    }

    pub fn list(&self, ctx: &OpContext, prefix: &str) -> Result<Vec<BlobMeta>, StorageError> {
        let scoped_prefix = blob_path(&self.user_id, prefix);
        let mut entries = self.engine.list(ctx, &self.app_id, &scoped_prefix)?;
        for meta in &mut entries {
            meta.path = strip_blob_prefix(&self.user_id, &meta.path).to_string();
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::queue::WriteQueue;
    use crate::substrate::Substrate;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn kv_scoping_isolates_users_and_unprefixes_on_list() {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        let kv = KvEngine::new(Arc::clone(&substrate), Arc::clone(&queue), config.kv_cache_capacity);
        let ctx = OpContext::background();

        let alice = ScopedKv::new(&kv, "app1", "alice");
        let bob = ScopedKv::new(&kv, "app1", "bob");

        alice.set(&ctx, "pref", Value::from(1), None).unwrap();
        assert_eq!(bob.get(&ctx, "pref").unwrap(), None);
        assert_eq!(alice.get(&ctx, "pref").unwrap(), Some(Value::from(1)));

        let listed = alice.list(&ctx, "").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "pref");
    }

    #[test]
    fn document_scoping_uses_distinct_collections() {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        let docs = DocumentEngine::new(Arc::clone(&substrate), Arc::clone(&queue));
        let ctx = OpContext::background();

        let alice = ScopedDocuments::new(&docs, "app1", "alice");
        let bob = ScopedDocuments::new(&docs, "app1", "bob");

        alice.insert(&ctx, "notes", Map::from_iter([("text".to_string(), json!("hi"))])).unwrap();
        assert!(bob.find(&ctx, "notes", &Map::new()).unwrap().is_empty());
        assert_eq!(alice.find(&ctx, "notes", &Map::new()).unwrap().len(), 1);
    }

    #[test]
    fn blob_scoping_unprefixes_listing_paths() {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        let blobs = crate::blobs::BlobEngine::new(Arc::clone(&substrate), Arc::clone(&queue));
        let ctx = OpContext::background();

        let alice = ScopedBlobs::new(&blobs, "app1", "alice");
        alice.put(&ctx, "photo.png", b"x".to_vec(), "image/png").unwrap();
        let listed = alice.list(&ctx, "").unwrap();
        assert_eq!(listed[0].path, "photo.png");
    }
}
