//! The KV engine (`spec.md` §4.4).
//!
//! Reads go directly to the substrate with retry; writes enqueue on the
//! write queue. A small in-process cache mirrors the teacher's TTL cache
//! pattern (`coplayer`/doc-cache style: a bounded map guarded by one lock,
//! evicted oldest-first) to absorb repeat reads without ever becoming the
//! source of truth — `Get` always falls back to the substrate on a miss.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::OptionalExtension;
use serde_json::Value;

use crate::context::OpContext;
use crate::error::StorageError;
use crate::queue::WriteQueue;
use crate::substrate::Substrate;
use crate::time::now_millis;
use crate::value::marshal;

#[derive(Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<i64>,
}

/// A bounded, lock-guarded read cache keyed by `(app_id, key)`. Oldest
/// entry is evicted on overflow, per `spec.md` §4.4.
struct Cache {
    capacity: usize,
    order: VecDeque<(String, String)>,
    entries: rustc_hash::FxHashMap<(String, String), CacheEntry>,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: rustc_hash::FxHashMap::default(),
        }
    }

    fn get(&self, app: &str, key: &str) -> Option<Value> {
        let entry = self.entries.get(&(app.to_string(), key.to_string()))?;
        if entry.expires_at.is_some_and(|exp| exp <= now_millis()) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Inserts an entry, evicting the oldest one on overflow. Returns
    /// `true` if an eviction occurred.
    fn put(&mut self, app: &str, key: &str, value: Value, expires_at: Option<i64>) -> bool {
        let composite = (app.to_string(), key.to_string());
        let mut evicted = false;
        if !self.entries.contains_key(&composite) {
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                    evicted = true;
                }
            }
            self.order.push_back(composite.clone());
        }
        self.entries.insert(composite, CacheEntry { value, expires_at });
        evicted
    }

    fn invalidate(&mut self, app: &str, key: &str) {
        let composite = (app.to_string(), key.to_string());
        self.entries.remove(&composite);
        self.order.retain(|k| k != &composite);
    }
}

/// Metadata returned alongside a `List` entry.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: Value,
}

/// Cache hit/miss/eviction counters, mirroring `spec.md` §4.2's `Stats()`
/// contract for the write queue so operators can reason about cache
/// effectiveness the same way (`SPEC_FULL.md` §C.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// The KV engine over a shared substrate and write queue.
pub struct KvEngine {
    substrate: Arc<Substrate>,
    queue: Arc<WriteQueue>,
    cache: Mutex<Cache>,
    counters: Counters,
}

impl KvEngine {
    pub fn new(substrate: Arc<Substrate>, queue: Arc<WriteQueue>, cache_capacity: usize) -> Self {
        Self {
            substrate,
            queue,
            cache: Mutex::new(Cache::new(cache_capacity)),
            counters: Counters::default(),
        }
    }

    /// Point-in-time cache hit/miss/eviction counters, cumulative since
    /// this engine was constructed.
    pub fn stats(&self) -> Stats {
        Stats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Upserts `(app, key) -> value`, with an optional millisecond TTL.
    pub fn set(
        &self,
        ctx: &OpContext,
        app: &str,
        key: &str,
        value: Value,
        ttl_ms: Option<i64>,
    ) -> Result<(), StorageError> {
        let app = app.to_string();
        let key = key.to_string();
        let payload = marshal(&value)?;
        let now = now_millis();
        let expires_at = ttl_ms.map(|ttl| now + ttl);

        self.cache.lock().expect("kv cache poisoned").invalidate(&app, &key);

        self.queue.submit(ctx, move |substrate| {
            let ctx = OpContext::background();
            substrate.with_retry(&ctx, |conn| {
                conn.execute(
                    "INSERT INTO app_kv (app_id, key, value, expires_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(app_id, key) DO UPDATE SET
                        value = excluded.value,
                        expires_at = excluded.expires_at,
                        updated_at = excluded.updated_at",
                    rusqlite::params![app, key, payload, expires_at, now],
                )?;
                Ok(())
            })
        })
    }

    /// Returns the live value for `(app, key)`, or `None` if absent/expired.
    pub fn get(&self, ctx: &OpContext, app: &str, key: &str) -> Result<Option<Value>, StorageError> {
        if let Some(cached) = self.cache.lock().expect("kv cache poisoned").get(app, key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(cached));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let now = now_millis();
        let row = self.substrate.with_retry(ctx, |conn| {
            conn.query_row(
                "SELECT value, expires_at FROM app_kv
                 WHERE app_id = ?1 AND key = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
                rusqlite::params![app, key, now],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()
            .map_err(Into::into)
        })?;

        let Some((raw, expires_at)) = row else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(&raw)?;
        let evicted = self
            .cache
            .lock()
            .expect("kv cache poisoned")
            .put(app, key, value.clone(), expires_at);
        if evicted {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Some(value))
    }

    /// Removes `(app, key)` from the substrate and the cache.
    pub fn delete(&self, ctx: &OpContext, app: &str, key: &str) -> Result<(), StorageError> {
        let app_owned = app.to_string();
        let key_owned = key.to_string();
        self.cache.lock().expect("kv cache poisoned").invalidate(app, key);
        self.queue.submit(ctx, move |substrate| {
            let ctx = OpContext::background();
            substrate.with_retry(&ctx, |conn| {
                conn.execute(
                    "DELETE FROM app_kv WHERE app_id = ?1 AND key = ?2",
                    rusqlite::params![app_owned, key_owned],
                )?;
                Ok(())
            })
        })
    }

    /// Lists live entries for `app` whose key starts with `prefix`, ordered
    /// by key. Bypasses the cache, per `spec.md` §4.4.
    pub fn list(&self, ctx: &OpContext, app: &str, prefix: &str) -> Result<Vec<KvEntry>, StorageError> {
        let now = now_millis();
        let like_pattern = format!("{}%", escape_like(prefix));
        self.substrate.with_retry(ctx, |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM app_kv
                 WHERE app_id = ?1 AND key LIKE ?2 ESCAPE '\\' AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY key ASC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![app, like_pattern, now], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(key, raw)| {
                    let value = serde_json::from_str(&raw)?;
                    Ok(KvEntry { key, value })
                })
                .collect()
        })
    }

    /// Deletes every row whose expiration has passed and drops the
    /// corresponding cache entries. Invoked by the background sweeper on
    /// `spec.md` §4.4's 5-minute interval.
    pub fn sweep_expired(&self, ctx: &OpContext) -> Result<usize, StorageError> {
        let now = now_millis();
        let removed = self.substrate.with_retry(ctx, |conn| {
            conn.execute(
                "DELETE FROM app_kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                rusqlite::params![now],
            )
            .map_err(Into::into)
        })?;

        if removed > 0 {
            let mut cache = self.cache.lock().expect("kv cache poisoned");
            cache.entries.retain(|_, entry| !entry.expires_at.is_some_and(|exp| exp <= now));
            let alive: HashSet<_> = cache.entries.keys().cloned().collect();
            cache.order.retain(|k| alive.contains(k));
        }

        Ok(removed)
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::time::Duration;

    fn new_engine() -> KvEngine {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        KvEngine::new(substrate, queue, config.kv_cache_capacity)
    }

    #[test]
    fn set_then_get_round_trips() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.set(&ctx, "app1", "k", Value::from(42), None).unwrap();
        let got = engine.get(&ctx, "app1", "k").unwrap();
        assert_eq!(got, Some(Value::from(42)));
    }

    #[test]
    fn isolation_across_apps() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.set(&ctx, "app1", "k", Value::from(1), None).unwrap();
        assert_eq!(engine.get(&ctx, "app2", "k").unwrap(), None);
    }

    #[test]
    fn ttl_expires_and_sweeps() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.set(&ctx, "app1", "k", Value::from("x"), Some(-1)).unwrap();
        assert_eq!(engine.get(&ctx, "app1", "k").unwrap(), None);
        let removed = engine.sweep_expired(&ctx).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn delete_removes_value() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.set(&ctx, "app1", "k", Value::from(1), None).unwrap();
        engine.delete(&ctx, "app1", "k").unwrap();
        assert_eq!(engine.get(&ctx, "app1", "k").unwrap(), None);
    }

    #[test]
    fn list_orders_by_key_and_excludes_expired() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.set(&ctx, "app1", "b", Value::from(2), None).unwrap();
        engine.set(&ctx, "app1", "a", Value::from(1), None).unwrap();
        engine.set(&ctx, "app1", "c", Value::from(3), Some(-1)).unwrap();
        let entries = engine.list(&ctx, "app1", "").unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn cache_hit_avoids_reparsing_but_matches_substrate() {
        let engine = new_engine();
        let ctx = OpContext::background();
        engine.set(&ctx, "app1", "k", Value::from("v1"), None).unwrap();
        assert_eq!(engine.get(&ctx, "app1", "k").unwrap(), Some(Value::from("v1")));
        assert_eq!(engine.get(&ctx, "app1", "k").unwrap(), Some(Value::from("v1")));
        let _ = Duration::from_millis(0);
    }

    #[test]
    fn stats_track_hits_misses_and_evictions() {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        let engine = KvEngine::new(substrate, queue, 2);
        let ctx = OpContext::background();

        engine.set(&ctx, "app1", "a", Value::from(1), None).unwrap();
        engine.get(&ctx, "app1", "a").unwrap(); // miss then cache-fill
        engine.get(&ctx, "app1", "a").unwrap(); // hit

        engine.set(&ctx, "app1", "b", Value::from(2), None).unwrap();
        engine.get(&ctx, "app1", "b").unwrap();
        engine.set(&ctx, "app1", "c", Value::from(3), None).unwrap();
        engine.get(&ctx, "app1", "c").unwrap(); // capacity 2: evicts "a"

        let stats = engine.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.evictions, 1);
    }
}
