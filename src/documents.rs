//! The document engine (`spec.md` §4.5).
//!
//! Documents are plain JSON objects keyed by `(app_id, collection, id)`.
//! Queries and update specs are translated by [`crate::query`] into SQL
//! fragments bound against `app_docs.data`. Reads go direct to the
//! substrate with retry; all mutations go through the write queue.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::OpContext;
use crate::error::StorageError;
use crate::query::{translate_query, translate_update};
use crate::queue::WriteQueue;
use crate::substrate::Substrate;
use crate::time::{new_id, now_millis};
use crate::value::{marshal, overlay, parse_object, strip_overlay};

/// Sort order for `Find`/`FindWithOptions`, per `spec.md` §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Default for Order {
    fn default() -> Self {
        Order::Desc
    }
}

/// Optional paging/ordering for `FindWithOptions`. `limit <= 0` means
/// unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub order: Order,
}

/// Either a structured query object or a bare id string, accepted by
/// `FindOne` per `spec.md` §4.5.
pub enum QueryOrId {
    Query(Map<String, Value>),
    Id(String),
}

impl QueryOrId {
    fn into_query(self) -> Map<String, Value> {
        match self {
            QueryOrId::Query(map) => map,
            QueryOrId::Id(id) => {
                let mut map = Map::new();
                map.insert("id".to_string(), Value::String(id));
                map
            }
        }
    }
}

/// The document engine over a shared substrate and write queue.
pub struct DocumentEngine {
    substrate: Arc<Substrate>,
    queue: Arc<WriteQueue>,
}

impl DocumentEngine {
    pub fn new(substrate: Arc<Substrate>, queue: Arc<WriteQueue>) -> Self {
        Self { substrate, queue }
    }

    /// Inserts `doc` into `(app, coll)`. If `doc.id` is a non-empty string
    /// it is used as the id; otherwise a fresh id is minted. Returns the
    /// id assigned. `id` is stripped from the stored payload.
    pub fn insert(
        &self,
        ctx: &OpContext,
        app: &str,
        coll: &str,
        doc: Map<String, Value>,
    ) -> Result<String, StorageError> {
        let id = match doc.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => new_id(),
        };
        // Physical index hint only (spec.md §9 Open Question 1): populated
        // from a top-level `session` field when present, never queried.
        let session_id = match doc.get("session") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        let payload = strip_overlay(doc);
        let serialized = marshal(&Value::Object(payload))?;
        let now = now_millis();

        let app = app.to_string();
        let coll = coll.to_string();
        let id_for_queue = id.clone();

        self.queue.submit(ctx, move |substrate| {
            let ctx = OpContext::background();
            substrate.with_retry(&ctx, |conn| {
                conn.execute(
                    "INSERT INTO app_docs (app_id, collection, id, data, session_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    rusqlite::params![app, coll, id_for_queue, serialized, session_id, now],
                )?;
                Ok(())
            })
        })?;

        Ok(id)
    }

    /// Finds documents matching `query`, most-recent-first by default.
    pub fn find(
        &self,
        ctx: &OpContext,
        app: &str,
        coll: &str,
        query: &Map<String, Value>,
    ) -> Result<Vec<Value>, StorageError> {
        self.find_with_options(ctx, app, coll, query, FindOptions::default())
    }

    /// `Find` with explicit limit/offset/order, per `spec.md` §4.5.
    pub fn find_with_options(
        &self,
        ctx: &OpContext,
        app: &str,
        coll: &str,
        query: &Map<String, Value>,
        options: FindOptions,
    ) -> Result<Vec<Value>, StorageError> {
        let predicate = translate_query(query)?;
        let order_sql = match options.order {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };

        let mut sql = format!(
            "SELECT id, data, created_at, updated_at FROM app_docs
             WHERE app_id = ? AND collection = ? AND ({})
             ORDER BY created_at {order_sql}, id {order_sql}",
            predicate.sql
        );

        let limit = options.limit.filter(|&l| l > 0);
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            if let Some(offset) = options.offset.filter(|&o| o > 0) {
                sql.push_str(" OFFSET ?");
                self.run_find(ctx, app, coll, &sql, predicate.params, Some(limit), Some(offset))
            } else {
                self.run_find(ctx, app, coll, &sql, predicate.params, Some(limit), None)
            }
        } else {
            self.run_find(ctx, app, coll, &sql, predicate.params, None, None)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_find(
        &self,
        ctx: &OpContext,
        app: &str,
        coll: &str,
        sql: &str,
        predicate_params: Vec<rusqlite::types::Value>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Value>, StorageError> {
        self.substrate.with_retry(ctx, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&app, &coll];
            for p in &predicate_params {
                params.push(p);
            }
            if let Some(limit) = &limit {
                params.push(limit);
            }
            if let Some(offset) = &offset {
                params.push(offset);
            }

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(id, raw, created_at, updated_at)| {
                    let payload = parse_object(&raw)?;
                    Ok(overlay(&payload, &id, created_at, updated_at))
                })
                .collect()
        })
    }

    /// `FindOne`: a bare id string is equivalent to `{id: s}`. Returns the
    /// single matching document, or `None`.
    pub fn find_one(
        &self,
        ctx: &OpContext,
        app: &str,
        coll: &str,
        query_or_id: QueryOrId,
    ) -> Result<Option<Value>, StorageError> {
        let query = query_or_id.into_query();
        let options = FindOptions {
            limit: Some(1),
            offset: None,
            order: Order::Desc,
        };
        let mut results = self.find_with_options(ctx, app, coll, &query, options)?;
        Ok(if results.is_empty() { None } else { Some(results.remove(0)) })
    }

    /// Applies `changes` to every document matching `query`; returns the
    /// affected row count.
    pub fn update(
        &self,
        ctx: &OpContext,
        app: &str,
        coll: &str,
        query: &Map<String, Value>,
        changes: &Map<String, Value>,
    ) -> Result<usize, StorageError> {
        let predicate = translate_query(query)?;
        let update_expr = translate_update(changes)?;
        let now = now_millis();

        // Parameter order: update_expr.params..., updated_at, app, coll, predicate.params...
        let sql = format!(
            "UPDATE app_docs SET data = {}, updated_at = ? WHERE app_id = ? AND collection = ? AND ({})",
            update_expr.sql, predicate.sql
        );

        let app = app.to_string();
        let coll = coll.to_string();
        let mut all_params: Vec<rusqlite::types::Value> = update_expr.params;
        all_params.push(rusqlite::types::Value::Integer(now));
        all_params.push(rusqlite::types::Value::Text(app.clone()));
        all_params.push(rusqlite::types::Value::Text(coll.clone()));
        all_params.extend(predicate.params);

        self.run_write_count(ctx, sql, all_params)
    }

    /// Deletes every document matching `query`; returns the affected count.
    pub fn delete(
        &self,
        ctx: &OpContext,
        app: &str,
        coll: &str,
        query: &Map<String, Value>,
    ) -> Result<usize, StorageError> {
        let predicate = translate_query(query)?;
        let sql = format!(
            "DELETE FROM app_docs WHERE app_id = ? AND collection = ? AND ({})",
            predicate.sql
        );

        let app = app.to_string();
        let coll = coll.to_string();
        let mut all_params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(app), rusqlite::types::Value::Text(coll)];
        all_params.extend(predicate.params);

        self.run_write_count(ctx, sql, all_params)
    }

    fn run_write_count(
        &self,
        ctx: &OpContext,
        sql: String,
        params: Vec<rusqlite::types::Value>,
    ) -> Result<usize, StorageError> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.queue.submit(ctx, move |substrate| {
            let ctx = OpContext::background();
            let result = substrate.with_retry(&ctx, |conn| {
                let refs: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
                conn.execute(&sql, refs.as_slice()).map_err(Into::into)
            });
            match &result {
                Ok(count) => {
                    let _ = tx.send(Ok(*count));
                }
                Err(_) => {
                    let _ = tx.send(Err(StorageError::Internal("document write failed".into())));
                }
            }
            result.map(|_| ())
        })?;
        rx.recv()
            .map_err(|_| StorageError::Internal("document write reply lost".into()))?
    }

    /// Counts documents matching `query`.
    pub fn count(&self, ctx: &OpContext, app: &str, coll: &str, query: &Map<String, Value>) -> Result<i64, StorageError> {
        let predicate = translate_query(query)?;
        let sql = format!(
            "SELECT COUNT(*) FROM app_docs WHERE app_id = ? AND collection = ? AND ({})",
            predicate.sql
        );
        self.substrate.with_retry(ctx, |conn| {
            let mut params: Vec<&dyn rusqlite::ToSql> = vec![&app, &coll];
            for p in &predicate.params {
                params.push(p);
            }
            conn.query_row(&sql, params.as_slice(), |row| row.get(0)).map_err(Into::into)
        })
    }

    /// Deletes every document in `(app, coll)` except the `keep_count`
    /// newest by creation time. `keep_count <= 0` deletes all, per
    /// `spec.md` §4.5.
    pub fn delete_oldest(&self, ctx: &OpContext, app: &str, coll: &str, keep_count: i64) -> Result<usize, StorageError> {
        let keep_count = keep_count.max(0);
        let app = app.to_string();
        let coll = coll.to_string();
        let sql = "DELETE FROM app_docs
             WHERE app_id = ?1 AND collection = ?2
             AND id NOT IN (
                SELECT id FROM app_docs
                WHERE app_id = ?1 AND collection = ?2
                ORDER BY created_at DESC, id DESC
                LIMIT ?3
             )"
        .to_string();
        let params: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Text(app),
            rusqlite::types::Value::Text(coll),
            rusqlite::types::Value::Integer(keep_count),
        ];
        self.run_write_count(ctx, sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use serde_json::json;

    fn new_engine() -> DocumentEngine {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        DocumentEngine::new(substrate, queue)
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn insert_and_find_one_round_trips() {
        let engine = new_engine();
        let ctx = OpContext::background();
        let id = engine.insert(&ctx, "app1", "users", obj(json!({"name": "a"}))).unwrap();
        let found = engine.find_one(&ctx, "app1", "users", QueryOrId::Id(id.clone())).unwrap().unwrap();
        assert_eq!(found["id"], json!(id));
        assert_eq!(found["name"], json!("a"));
        assert!(found["_createdAt"].is_number());
    }

    #[test]
    fn insert_honors_client_supplied_id() {
        let engine = new_engine();
        let ctx = OpContext::background();
        let id = engine
            .insert(&ctx, "app1", "users", obj(json!({"id": "fixed", "name": "a"})))
            .unwrap();
        assert_eq!(id, "fixed");
    }

    #[test]
    fn update_applies_set_and_returns_count() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.insert(&ctx, "app1", "users", obj(json!({"name": "a", "age": 1}))).unwrap();
        let count = engine
            .update(&ctx, "app1", "users", &obj(json!({"name": "a"})), &obj(json!({"$set": {"age": 2}})))
            .unwrap();
        assert_eq!(count, 1);
        let found = engine.find_one(&ctx, "app1", "users", QueryOrId::Query(obj(json!({"name": "a"})))).unwrap().unwrap();
        assert_eq!(found["age"], json!(2));
    }

    #[test]
    fn delete_oldest_keeps_newest_k() {
        let engine = new_engine();
        let ctx = OpContext::background();
        for i in 0..5 {
            engine.insert(&ctx, "app1", "logs", obj(json!({"n": i}))).unwrap();
        }
        let removed = engine.delete_oldest(&ctx, "app1", "logs", 2).unwrap();
        assert_eq!(removed, 3);
        let count = engine.count(&ctx, "app1", "logs", &Map::new()).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn isolation_across_apps() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.insert(&ctx, "app1", "users", obj(json!({"name": "a"}))).unwrap();
        let found = engine.find(&ctx, "app2", "users", &Map::new()).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn delete_matching_query_removes_rows() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.insert(&ctx, "app1", "users", obj(json!({"name": "a"}))).unwrap();
        engine.insert(&ctx, "app1", "users", obj(json!({"name": "b"}))).unwrap();
        let removed = engine.delete(&ctx, "app1", "users", &obj(json!({"name": "a"}))).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(engine.count(&ctx, "app1", "users", &Map::new()).unwrap(), 1);
    }
}
