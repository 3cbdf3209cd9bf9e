//! Multi-tenant storage core for a single-binary personal-cloud platform.
//!
//! This crate is the storage layer beneath a script-runtime-hosted
//! application platform: every tenant app gets a KV store, a document
//! store, and a blob store, all backed by one embedded relational
//! substrate (SQLite) opened through exactly one connection. Concurrency
//! safety comes from a single-writer queue in front of that connection,
//! not from per-table locks.
//!
//! # Layout
//!
//! - [`substrate`] — the connection adapter: pragmas, retry-on-busy.
//! - [`queue`] — the bounded single-writer write queue and admission
//!   control.
//! - [`budget`] and [`context`] — per-request deadline tracking and the
//!   cooperative cancellation context threaded through every operation.
//! - [`query`] — the document query/update translator.
//! - [`kv`], [`documents`], [`blobs`] — the three storage engines.
//! - [`scoped`] — user-scoped wrapper decorators over the engines.
//! - [`auth`] — authentication companion tables (users, sessions, OAuth
//!   state), exposed narrowly.
//! - [`cleanup`] — background TTL/session sweepers.
//! - [`binding`] — the façade the script runtime calls through.
//!
//! # What this crate does not do
//!
//! No HTTP surface, no script-runtime embedding, no OAuth provider
//! integration, no ad-hoc tenant SQL, no schema-per-tenant isolation, no
//! distributed replication. Those are external collaborators; this crate
//! exposes typed operations to them and depends on none of their
//! internals.

pub mod auth;
pub mod binding;
pub mod blobs;
pub mod budget;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod documents;
pub mod error;
pub mod kv;
pub mod query;
pub mod queue;
pub mod scoped;
pub mod substrate;
pub mod time;
pub mod value;

use std::sync::Arc;

use crate::auth::AuthStore;
use crate::binding::AppBinding;
use crate::blobs::BlobEngine;
use crate::cleanup::CleanupDaemon;
use crate::config::StorageConfig;
use crate::documents::DocumentEngine;
use crate::error::StorageError;
use crate::kv::KvEngine;
use crate::queue::WriteQueue;
use crate::substrate::Substrate;

/// Owns the substrate, the write queue, every engine, and the background
/// sweeper for one process. One `StorageCore` per running instance; each
/// tenant app's [`AppBinding`] (or user-scoped binding) is built on top of
/// the shared engines here.
pub struct StorageCore {
    pub substrate: Arc<Substrate>,
    pub queue: Arc<WriteQueue>,
    pub kv: Arc<KvEngine>,
    pub documents: Arc<DocumentEngine>,
    pub blobs: Arc<BlobEngine>,
    pub auth: Arc<AuthStore>,
    cleanup: CleanupDaemon,
    config: StorageConfig,
}

impl StorageCore {
    /// Opens the substrate at `path` (or `:memory:`), wires up the write
    /// queue and every engine, and starts the background sweeper.
    pub fn open(path: &str, config: StorageConfig) -> Result<Self, StorageError> {
        let substrate = Arc::new(Substrate::open(path, &config)?);
        let queue = Arc::new(WriteQueue::new(
            Arc::clone(&substrate),
            config.queue_capacity,
            config.queue_wait_estimate,
            config.admission_floor,
        ));
        let kv = Arc::new(KvEngine::new(Arc::clone(&substrate), Arc::clone(&queue), config.kv_cache_capacity));
        let documents = Arc::new(DocumentEngine::new(Arc::clone(&substrate), Arc::clone(&queue)));
        let blobs = Arc::new(BlobEngine::new(Arc::clone(&substrate), Arc::clone(&queue)));
        let auth = Arc::new(AuthStore::new(Arc::clone(&substrate)));
        let cleanup = CleanupDaemon::spawn(Arc::clone(&kv), Arc::clone(&auth), config.sweep_interval);

        Ok(Self {
            substrate,
            queue,
            kv,
            documents,
            blobs,
            auth,
            cleanup,
            config,
        })
    }

    /// Opens an in-memory core, for tests and ephemeral use.
    pub fn open_in_memory(config: StorageConfig) -> Result<Self, StorageError> {
        Self::open(":memory:", config)
    }

    /// Builds the shared (non-user) binding surface for `app_id`.
    pub fn app_binding(&self, app_id: impl Into<String>) -> AppBinding {
        AppBinding::new(app_id, Arc::clone(&self.kv), Arc::clone(&self.documents), Arc::clone(&self.blobs))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Stops the background sweeper without dropping the core, for tests
    /// that want a quiet shutdown sequence.
    pub fn stop_cleanup(&mut self) {
        self.cleanup.stop();
    }
}
