//! The substrate adapter: the single SQLite connection every engine reads
//! and writes through (`spec.md` §4.1).
//!
//! The adapter owns the connection handle exclusively. Reads call
//! [`Substrate::with_retry`] directly from the caller's thread; the write
//! queue (`crate::queue`) is the only caller that reaches the connection
//! for mutations, and it does so through the same `with_retry` wrapper
//! inside its worker thread. No engine opens a transaction outside the
//! queue for a write.

pub mod schema;

use std::sync::Mutex;
use std::thread::sleep;
use std::time::Duration;

use rusqlite::Connection;

use crate::config::StorageConfig;
use crate::context::OpContext;
use crate::error::StorageError;

/// Substrings that mark a SQLite error as transient lock contention rather
/// than a genuine failure, per `spec.md` §4.1.
const TRANSIENT_MARKERS: [&str; 3] = ["SQLITE_BUSY", "database is locked", "database table is locked"];

/// Owns the single connection to the embedded relational store.
///
/// `conn` is behind a `Mutex` rather than reopened per call: the spec calls
/// for exactly one connection instance, and `rusqlite::Connection` is not
/// `Sync`, so a mutex is the only sound way to share one handle across the
/// reader threads and the write-queue worker. This does mean reads briefly
/// serialize against each other and against the writer at the connection
/// level; the spec's read/write ordering guarantees (`spec.md` §5) hold
/// regardless, since they are phrased as "need not be serialized", not
/// "must run concurrently".
pub struct Substrate {
    conn: Mutex<Connection>,
    retry_attempts: u32,
    retry_initial_backoff: Duration,
}

impl Substrate {
    /// Opens the substrate connection at `path` (or `:memory:`) and applies
    /// the standard pragmas: WAL journaling, `NORMAL` synchronous mode, and
    /// foreign keys off (relations are enforced in application code, not by
    /// the substrate).
    pub fn open(path: &str, config: &StorageConfig) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", false)?;
        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            retry_attempts: config.retry_attempts,
            retry_initial_backoff: config.retry_initial_backoff,
        })
    }

    /// Opens an in-memory substrate, for tests and ephemeral use.
    pub fn open_in_memory(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::open(":memory:", config)
    }

    /// Executes `op` against the connection, retrying on transient lock
    /// contention with exponential backoff starting at `retry_initial_backoff`
    /// and doubling each attempt, up to `retry_attempts` retries. Honors
    /// `ctx` cancellation between sleeps. Any other error is returned
    /// verbatim.
    pub fn with_retry<F, T>(&self, ctx: &OpContext, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut(&Connection) -> Result<T, StorageError>,
    {
        let mut attempt = 0u32;
        let mut backoff = self.retry_initial_backoff;
        loop {
            if ctx.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let result = {
                let conn = self
                    .conn
                    .lock()
                    .map_err(|_| StorageError::Internal("substrate connection poisoned".into()))?;
                op(&conn)
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retry_attempts && is_transient(&err) => {
                    attempt += 1;
                    if ctx.is_cancelled() {
                        return Err(StorageError::Cancelled);
                    }
                    sleep(backoff);
                    backoff *= 2;
                    if ctx.is_cancelled() {
                        return Err(StorageError::Cancelled);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_transient(err: &StorageError) -> bool {
    let text = err.to_string();
    TRANSIENT_MARKERS.iter().any(|marker| text.contains(marker))
}
