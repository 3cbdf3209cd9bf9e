//! JSON value helpers shared by the document engine and query translator.
//!
//! Documents are stored as a bare JSON object in `app_docs.data`; the
//! `id`, `_createdAt`, and `_updatedAt` fields a caller sees are an overlay
//! applied on read, never part of the stored payload (`spec.md` §3: "`id`
//! is stored separately from the payload and is never read from payload
//! JSON").

use serde_json::{Map, Value};

use crate::error::StorageError;

/// Parses `raw` as a JSON object, rejecting any other JSON shape.
pub fn parse_object(raw: &str) -> Result<Map<String, Value>, StorageError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(StorageError::InvalidArgument(
            "corrupt stored document: not a JSON object".to_string(),
        )),
    }
}

/// Validates that `value` is a JSON object and returns it, erroring
/// otherwise. Used to reject non-object `doc`/`changes` arguments at the
/// façade per `spec.md` §4.9.
pub fn require_object(value: &Value, what: &str) -> Result<Map<String, Value>, StorageError> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(StorageError::InvalidArgument(format!("{what} must be an object"))),
    }
}

/// Overlays the reserved `id`, `_createdAt`, `_updatedAt` keys onto a
/// stored document's payload for return to the caller. The stored payload
/// itself is left untouched; this produces a fresh owned value.
pub fn overlay(payload: &Map<String, Value>, id: &str, created_at: i64, updated_at: i64) -> Value {
    let mut out = payload.clone();
    out.insert("id".to_string(), Value::String(id.to_string()));
    out.insert("_createdAt".to_string(), Value::from(created_at));
    out.insert("_updatedAt".to_string(), Value::from(updated_at));
    Value::Object(out)
}

/// Strips the reserved overlay keys back out before persisting, so they
/// never leak into the stored payload even if a caller round-trips a
/// document it previously read.
pub fn strip_overlay(mut payload: Map<String, Value>) -> Map<String, Value> {
    payload.remove("id");
    payload.remove("_createdAt");
    payload.remove("_updatedAt");
    payload
}

/// Serializes `value` to its canonical JSON text form, as bound into
/// `json(?)` placeholders by the query translator.
pub fn marshal(value: &Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(Into::into)
}
