//! The binding façade (`spec.md` §4.9): a uniform, versioned namespace
//! exposed to the embedded script runtime (out of scope in this crate).
//!
//! Every entry point takes loosely-typed `serde_json::Value` arguments, the
//! shape a script-runtime boundary actually hands over, validates them
//! deterministically before touching any engine, and shapes results per
//! the spec's value conventions (base64 blobs, `{id, _createdAt,
//! _updatedAt}` document overlay, affected counts). `app.user.*` methods
//! require an authenticated user and fail with `AuthFailure::InvalidSession`
//! otherwise — the spec's "requires login" failure mode.

use std::sync::Arc;

use base64::Engine as _;
use serde_json::{Map, Value, json};

use crate::blobs::BlobEngine;
use crate::context::OpContext;
use crate::documents::{DocumentEngine, FindOptions, Order, QueryOrId};
use crate::error::{AuthFailure, StorageError};
use crate::kv::KvEngine;
use crate::scoped::{ScopedBlobs, ScopedDocuments, ScopedKv};
use crate::value::require_object;

/// The app-scoped (non-user) binding surface: `app.kv`, `app.ds`, `app.s3`.
pub struct AppBinding {
    app_id: String,
    kv: Arc<KvEngine>,
    docs: Arc<DocumentEngine>,
    blobs: Arc<BlobEngine>,
}

impl AppBinding {
    pub fn new(app_id: impl Into<String>, kv: Arc<KvEngine>, docs: Arc<DocumentEngine>, blobs: Arc<BlobEngine>) -> Self {
        Self {
            app_id: app_id.into(),
            kv,
            docs,
            blobs,
        }
    }

    /// `app.kv.set(key, value, ttl_ms?)`: requires two args; a present
    /// third argument is coerced to an integer millisecond TTL.
    pub fn kv_set(&self, ctx: &OpContext, key: &str, value: Value, ttl_ms: Option<Value>) -> Result<Value, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("kv.set requires key and value".to_string()));
        }
        let ttl = ttl_ms.map(coerce_integer_millis).transpose()?;
        self.kv.set(ctx, &self.app_id, key, value, ttl)?;
        Ok(json!({"affected": 1}))
    }

    pub fn kv_get(&self, ctx: &OpContext, key: &str) -> Result<Value, StorageError> {
        Ok(self.kv.get(ctx, &self.app_id, key)?.unwrap_or(Value::Null))
    }

    pub fn kv_delete(&self, ctx: &OpContext, key: &str) -> Result<Value, StorageError> {
        self.kv.delete(ctx, &self.app_id, key)?;
        Ok(json!({"affected": 1}))
    }

    pub fn kv_list(&self, ctx: &OpContext, prefix: Option<&str>) -> Result<Value, StorageError> {
        let entries = self.kv.list(ctx, &self.app_id, prefix.unwrap_or(""))?;
        Ok(Value::Array(
            entries.into_iter().map(|e| json!({"key": e.key, "value": e.value})).collect(),
        ))
    }

    /// `app.ds.insert(coll, doc)`: `doc` must be an object.
    pub fn ds_insert(&self, ctx: &OpContext, coll: &str, doc: &Value) -> Result<Value, StorageError> {
        let doc = require_object(doc, "ds.insert doc")?;
        let id = self.docs.insert(ctx, &self.app_id, coll, doc)?;
        Ok(json!({"id": id}))
    }

    pub fn ds_find(
        &self,
        ctx: &OpContext,
        coll: &str,
        query: Option<&Value>,
        options: Option<&Value>,
    ) -> Result<Value, StorageError> {
        let query = parse_query_arg(query)?;
        let options = parse_find_options(options)?;
        let results = self.docs.find_with_options(ctx, &self.app_id, coll, &query, options)?;
        Ok(Value::Array(results))
    }

    /// `app.ds.findOne(coll, query|id)`: a bare string is `{id: s}`.
    pub fn ds_find_one(&self, ctx: &OpContext, coll: &str, query_or_id: &Value) -> Result<Value, StorageError> {
        let query_or_id = parse_query_or_id(query_or_id)?;
        Ok(self.docs.find_one(ctx, &self.app_id, coll, query_or_id)?.unwrap_or(Value::Null))
    }

    pub fn ds_update(&self, ctx: &OpContext, coll: &str, query: &Value, changes: &Value) -> Result<Value, StorageError> {
        let query = require_object(query, "ds.update query")?;
        let changes = require_object(changes, "ds.update changes")?;
        let affected = self.docs.update(ctx, &self.app_id, coll, &query, &changes)?;
        Ok(json!({"affected": affected}))
    }

    pub fn ds_delete(&self, ctx: &OpContext, coll: &str, query: &Value) -> Result<Value, StorageError> {
        let query = require_object(query, "ds.delete query")?;
        let affected = self.docs.delete(ctx, &self.app_id, coll, &query)?;
        Ok(json!({"affected": affected}))
    }

    pub fn ds_count(&self, ctx: &OpContext, coll: &str, query: Option<&Value>) -> Result<Value, StorageError> {
        let query = parse_query_arg(query)?;
        let count = self.docs.count(ctx, &self.app_id, coll, &query)?;
        Ok(json!(count))
    }

    /// `app.ds.deleteOldest(coll, keepCount)` — shared scope only; absent
    /// from the `app.user.ds` surface, per `spec.md` §4.9.
    pub fn ds_delete_oldest(&self, ctx: &OpContext, coll: &str, keep_count: i64) -> Result<Value, StorageError> {
        let affected = self.docs.delete_oldest(ctx, &self.app_id, coll, keep_count)?;
        Ok(json!({"affected": affected}))
    }

    /// `app.s3.put(path, data, mime?)`: `data` is literal string bytes, a
    /// byte array, or `{"base64": "..."}` for base64-encoded payloads;
    /// missing MIME defaults to `application/octet-stream`.
    pub fn s3_put(&self, ctx: &OpContext, path: &str, data: &Value, mime: Option<&str>) -> Result<Value, StorageError> {
        let bytes = decode_blob_body(data)?;
        let mime = mime.unwrap_or("application/octet-stream");
        self.blobs.put(ctx, &self.app_id, path, bytes, mime)?;
        Ok(json!({"affected": 1}))
    }

    pub fn s3_get(&self, ctx: &OpContext, path: &str) -> Result<Value, StorageError> {
        match self.blobs.get(ctx, &self.app_id, path)? {
            Some(blob) => Ok(json!({
                "data": base64::engine::general_purpose::STANDARD.encode(&blob.data),
                "mime": blob.meta.mime_type,
                "size": blob.meta.size_bytes,
                "hash": blob.meta.hash,
            })),
            None => Ok(Value::Null),
        }
    }

    pub fn s3_delete(&self, ctx: &OpContext, path: &str) -> Result<Value, StorageError> {
        self.blobs.delete(ctx, &self.app_id, path)?;
        Ok(json!({"affected": 1}))
    }

    pub fn s3_list(&self, ctx: &OpContext, prefix: Option<&str>) -> Result<Value, StorageError> {
        let metas = self.blobs.list(ctx, &self.app_id, prefix.unwrap_or(""))?;
        Ok(Value::Array(
            metas
                .into_iter()
                .map(|m| json!({"path": m.path, "mime": m.mime_type, "size": m.size_bytes, "hash": m.hash}))
                .collect(),
        ))
    }
}

/// The `app.user.{kv,ds,s3}` binding surface: identical shape to
/// [`AppBinding`] minus `deleteOldest`, scoped to `(app_id, user_id)`, and
/// only constructible for an authenticated request.
pub struct UserBinding<'a> {
    kv: ScopedKv<'a>,
    docs: ScopedDocuments<'a>,
    blobs: ScopedBlobs<'a>,
}

impl<'a> UserBinding<'a> {
    /// Builds a user binding, or fails with `AuthFailure::InvalidSession`
    /// (the spec's "requires login" failure mode) if `user_id` is absent.
    pub fn for_user(
        app_id: &str,
        user_id: Option<&str>,
        kv: &'a KvEngine,
        docs: &'a DocumentEngine,
        blobs: &'a BlobEngine,
    ) -> Result<Self, StorageError> {
        let user_id = user_id.ok_or(StorageError::AuthFailure(AuthFailure::InvalidSession))?;
        Ok(Self {
            kv: ScopedKv::new(kv, app_id, user_id),
            docs: ScopedDocuments::new(docs, app_id, user_id),
            blobs: ScopedBlobs::new(blobs, app_id, user_id),
        })
    }

    pub fn kv_set(&self, ctx: &OpContext, key: &str, value: Value, ttl_ms: Option<Value>) -> Result<Value, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("kv.set requires key and value".to_string()));
        }
        let ttl = ttl_ms.map(coerce_integer_millis).transpose()?;
        self.kv.set(ctx, key, value, ttl)?;
        Ok(json!({"affected": 1}))
    }

    pub fn kv_get(&self, ctx: &OpContext, key: &str) -> Result<Value, StorageError> {
        Ok(self.kv.get(ctx, key)?.unwrap_or(Value::Null))
    }

    pub fn kv_delete(&self, ctx: &OpContext, key: &str) -> Result<Value, StorageError> {
        self.kv.delete(ctx, key)?;
        Ok(json!({"affected": 1}))
    }

    pub fn kv_list(&self, ctx: &OpContext, prefix: Option<&str>) -> Result<Value, StorageError> {
        let entries = self.kv.list(ctx, prefix.unwrap_or(""))?;
        Ok(Value::Array(
            entries.into_iter().map(|e| json!({"key": e.key, "value": e.value})).collect(),
        ))
    }

    pub fn ds_insert(&self, ctx: &OpContext, coll: &str, doc: &Value) -> Result<Value, StorageError> {
        let doc = require_object(doc, "ds.insert doc")?;
        let id = self.docs.insert(ctx, coll, doc)?;
        Ok(json!({"id": id}))
    }

    pub fn ds_find(
        &self,
        ctx: &OpContext,
        coll: &str,
        query: Option<&Value>,
        options: Option<&Value>,
    ) -> Result<Value, StorageError> {
        let query = parse_query_arg(query)?;
        let options = parse_find_options(options)?;
        let results = self.docs.find_with_options(ctx, coll, &query, options)?;
        Ok(Value::Array(results))
    }

    pub fn ds_find_one(&self, ctx: &OpContext, coll: &str, query_or_id: &Value) -> Result<Value, StorageError> {
        let query_or_id = parse_query_or_id(query_or_id)?;
        Ok(self.docs.find_one(ctx, coll, query_or_id)?.unwrap_or(Value::Null))
    }

    pub fn ds_update(&self, ctx: &OpContext, coll: &str, query: &Value, changes: &Value) -> Result<Value, StorageError> {
        let query = require_object(query, "ds.update query")?;
        let changes = require_object(changes, "ds.update changes")?;
        let affected = self.docs.update(ctx, coll, &query, &changes)?;
        Ok(json!({"affected": affected}))
    }

    pub fn ds_delete(&self, ctx: &OpContext, coll: &str, query: &Value) -> Result<Value, StorageError> {
        let query = require_object(query, "ds.delete query")?;
        let affected = self.docs.delete(ctx, coll, &query)?;
        Ok(json!({"affected": affected}))
    }

    pub fn ds_count(&self, ctx: &OpContext, coll: &str, query: Option<&Value>) -> Result<Value, StorageError> {
        let query = parse_query_arg(query)?;
        let count = self.docs.count(ctx, coll, &query)?;
        Ok(json!(count))
    }

    pub fn s3_put(&self, ctx: &OpContext, path: &str, data: &Value, mime: Option<&str>) -> Result<Value, StorageError> {
        let bytes = decode_blob_body(data)?;
        let mime = mime.unwrap_or("application/octet-stream");
        self.blobs.put(ctx, path, bytes, mime)?;
        Ok(json!({"affected": 1}))
    }

    pub fn s3_get(&self, ctx: &OpContext, path: &str) -> Result<Value, StorageError> {
        match self.blobs.get(ctx, path)? {
            Some(blob) => Ok(json!({
                "data": base64::engine::general_purpose::STANDARD.encode(&blob.data),
                "mime": blob.meta.mime_type,
                "size": blob.meta.size_bytes,
                "hash": blob.meta.hash,
            })),
            None => Ok(Value::Null),
        }
    }

    pub fn s3_delete(&self, ctx: &OpContext, path: &str) -> Result<Value, StorageError> {
        self.blobs.delete(ctx, path)?;
        Ok(json!({"affected": 1}))
    }

    pub fn s3_list(&self, ctx: &OpContext, prefix: Option<&str>) -> Result<Value, StorageError> {
        let metas = self.blobs.list(ctx, prefix.unwrap_or(""))?;
        Ok(Value::Array(
            metas
                .into_iter()
                .map(|m| json!({"path": m.path, "mime": m.mime_type, "size": m.size_bytes, "hash": m.hash}))
                .collect(),
        ))
    }
}

fn coerce_integer_millis(value: Value) -> Result<i64, StorageError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| StorageError::InvalidArgument("ttl_ms must be an integer".to_string())),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| StorageError::InvalidArgument("ttl_ms must be an integer".to_string())),
        Value::Null => Ok(0),
        _ => Err(StorageError::InvalidArgument("ttl_ms must be an integer".to_string())),
    }
}

fn parse_query_arg(query: Option<&Value>) -> Result<Map<String, Value>, StorageError> {
    match query {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(value) => require_object(value, "query"),
    }
}

fn parse_query_or_id(value: &Value) -> Result<QueryOrId, StorageError> {
    match value {
        Value::String(s) => Ok(QueryOrId::Id(s.clone())),
        Value::Object(map) => Ok(QueryOrId::Query(map.clone())),
        _ => Err(StorageError::InvalidArgument(
            "findOne requires a string id or a query object".to_string(),
        )),
    }
}

fn parse_find_options(options: Option<&Value>) -> Result<FindOptions, StorageError> {
    let Some(Value::Object(map)) = options else {
        return Ok(FindOptions::default());
    };

    let limit = map.get("limit").and_then(Value::as_i64);
    let offset = map.get("offset").and_then(Value::as_i64);
    let order = match map.get("order").and_then(Value::as_str) {
        Some("asc") => Order::Asc,
        Some("desc") | None => Order::Desc,
        Some(other) => {
            return Err(StorageError::InvalidArgument(format!("unknown order {other}")));
        }
    };

    Ok(FindOptions { limit, offset, order })
}

/// `s3.put`'s body: a string is taken as literal UTF-8 bytes, a byte array
/// is taken as-is, and `{"base64": "..."}` is the explicit opt-in shape for
/// base64-encoded payloads. Per `spec.md` §4.9, a string is literal bytes
/// first — there is no implicit base64 sniffing, since a literal string
/// that happens to be valid base64 (e.g. `"aGk="`) must round-trip as
/// itself, not get silently reinterpreted.
fn decode_blob_body(data: &Value) -> Result<Vec<u8>, StorageError> {
    match data {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Object(map) => {
            let encoded = map.get("base64").and_then(Value::as_str).ok_or_else(|| {
                StorageError::InvalidArgument(
                    "s3.put object body must be {\"base64\": \"...\"}".to_string(),
                )
            })?;
            base64::engine::general_purpose::STANDARD.decode(encoded).map_err(|_| {
                StorageError::InvalidArgument("s3.put base64 payload is not valid base64".to_string())
            })
        }
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .filter(|&b| b <= u8::MAX as u64)
                    .map(|b| b as u8)
                    .ok_or_else(|| StorageError::InvalidArgument("blob byte array must contain 0-255 integers".to_string()))
            })
            .collect(),
        _ => Err(StorageError::InvalidArgument(
            "s3.put data must be a string, byte array, or {\"base64\": \"...\"} object".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::queue::WriteQueue;
    use crate::substrate::Substrate;

    fn new_binding() -> AppBinding {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        let kv = Arc::new(KvEngine::new(Arc::clone(&substrate), Arc::clone(&queue), config.kv_cache_capacity));
        let docs = Arc::new(DocumentEngine::new(Arc::clone(&substrate), Arc::clone(&queue)));
        let blobs = Arc::new(BlobEngine::new(Arc::clone(&substrate), Arc::clone(&queue)));
        AppBinding::new("app1", kv, docs, blobs)
    }

    #[test]
    fn kv_round_trips_through_binding() {
        let binding = new_binding();
        let ctx = OpContext::background();
        binding.kv_set(&ctx, "k", json!(42), None).unwrap();
        assert_eq!(binding.kv_get(&ctx, "k").unwrap(), json!(42));
    }

    #[test]
    fn kv_set_coerces_string_ttl() {
        let binding = new_binding();
        let ctx = OpContext::background();
        binding.kv_set(&ctx, "k", json!(1), Some(json!("-1"))).unwrap();
        assert_eq!(binding.kv_get(&ctx, "k").unwrap(), Value::Null);
    }

    #[test]
    fn ds_insert_then_find_one_returns_overlay() {
        let binding = new_binding();
        let ctx = OpContext::background();
        let inserted = binding.ds_insert(&ctx, "notes", &json!({"text": "hi"})).unwrap();
        let id = inserted["id"].as_str().unwrap();
        let found = binding.ds_find_one(&ctx, "notes", &json!(id)).unwrap();
        assert_eq!(found["text"], json!("hi"));
        assert_eq!(found["id"], json!(id));
    }

    #[test]
    fn ds_insert_rejects_non_object_doc() {
        let binding = new_binding();
        let ctx = OpContext::background();
        let err = binding.ds_insert(&ctx, "notes", &json!("not an object")).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn s3_put_accepts_literal_string_body() {
        let binding = new_binding();
        let ctx = OpContext::background();
        binding.s3_put(&ctx, "a.txt", &json!("hello"), None).unwrap();
        let got = binding.s3_get(&ctx, "a.txt").unwrap();
        assert_eq!(got["mime"], json!("application/octet-stream"));
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(got["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn s3_put_accepts_byte_array_body() {
        let binding = new_binding();
        let ctx = OpContext::background();
        binding.s3_put(&ctx, "a.bin", &json!([104, 105]), Some("application/octet-stream")).unwrap();
        let got = binding.s3_get(&ctx, "a.bin").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(got["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"hi");
    }

    #[test]
    fn s3_put_treats_base64_looking_string_as_literal_bytes() {
        let binding = new_binding();
        let ctx = OpContext::background();
        // "aGk=" is valid base64 for "hi", but as a plain string it must be
        // stored as its own literal bytes, not decoded.
        binding.s3_put(&ctx, "a.txt", &json!("aGk="), None).unwrap();
        let got = binding.s3_get(&ctx, "a.txt").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(got["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"aGk=");
    }

    #[test]
    fn s3_put_decodes_explicit_base64_object_body() {
        let binding = new_binding();
        let ctx = OpContext::background();
        binding.s3_put(&ctx, "a.bin", &json!({"base64": "aGk="}), None).unwrap();
        let got = binding.s3_get(&ctx, "a.bin").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(got["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"hi");
    }

    #[test]
    fn s3_put_rejects_invalid_base64_object_body() {
        let binding = new_binding();
        let ctx = OpContext::background();
        let err = binding.s3_put(&ctx, "a.bin", &json!({"base64": "not valid base64!"}), None).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn user_binding_requires_login() {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        let kv = KvEngine::new(Arc::clone(&substrate), Arc::clone(&queue), config.kv_cache_capacity);
        let docs = DocumentEngine::new(Arc::clone(&substrate), Arc::clone(&queue));
        let blobs = BlobEngine::new(Arc::clone(&substrate), Arc::clone(&queue));

        let err = UserBinding::for_user("app1", None, &kv, &docs, &blobs).unwrap_err();
        assert!(matches!(err, StorageError::AuthFailure(AuthFailure::InvalidSession)));
    }
}
