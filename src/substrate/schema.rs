//! Canonical SQL schema for every table the storage core owns
//! (`spec.md` §6 "Substrate schema").
//!
//! Mirrors the teacher's `schemas.rs`: one `CREATE TABLE IF NOT EXISTS`
//! constant per table, grouped by the engine that owns it, applied once at
//! [`crate::substrate::Substrate::open`] time. Columns are additive only —
//! nothing here is ever `ALTER`ed or dropped by this crate.

use rusqlite::Connection;

use crate::error::StorageError;

// --- KV engine ---
pub const APP_KV_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS app_kv (
        app_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        expires_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (app_id, key)
    )
";
pub const APP_KV_INDEX_EXPIRES: &str =
    "CREATE INDEX IF NOT EXISTS idx_app_kv_expires ON app_kv(expires_at)";

// --- Document engine ---
pub const APP_DOCS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS app_docs (
        app_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        session_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (app_id, collection, id)
    )
";
pub const APP_DOCS_INDEX_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_app_docs_created ON app_docs(app_id, collection, created_at, id)";
pub const APP_DOCS_INDEX_SESSION: &str =
    "CREATE INDEX IF NOT EXISTS idx_app_docs_session ON app_docs(app_id, collection, session_id)";

// --- Blob engine ---
pub const APP_BLOBS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS app_blobs (
        app_id TEXT NOT NULL,
        path TEXT NOT NULL,
        data BLOB NOT NULL,
        mime_type TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (app_id, path)
    )
";

// --- Authentication companions ---
pub const AUTH_USERS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth_users (
        user_id TEXT PRIMARY KEY,
        role TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

pub const AUTH_SESSIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth_sessions (
        token_hash TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    )
";
pub const AUTH_SESSIONS_INDEX_EXPIRES: &str =
    "CREATE INDEX IF NOT EXISTS idx_auth_sessions_expires ON auth_sessions(expires_at)";

pub const AUTH_STATES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth_states (
        token TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        payload TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
";
pub const AUTH_STATES_INDEX_EXPIRES: &str =
    "CREATE INDEX IF NOT EXISTS idx_auth_states_expires ON auth_states(expires_at)";

pub const AUTH_PROVIDERS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth_providers (
        name TEXT PRIMARY KEY,
        enabled INTEGER NOT NULL DEFAULT 1,
        config TEXT NOT NULL DEFAULT '{}'
    )
";

pub const AUTH_INVITES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth_invites (
        token TEXT PRIMARY KEY,
        role TEXT NOT NULL,
        used INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        expires_at INTEGER
    )
";

/// Applies every `CREATE TABLE IF NOT EXISTS` / index statement this crate
/// owns. Idempotent — safe to call on every process start.
pub fn initialize(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(APP_KV_SCHEMA, [])?;
    conn.execute(APP_KV_INDEX_EXPIRES, [])?;

    conn.execute(APP_DOCS_SCHEMA, [])?;
    conn.execute(APP_DOCS_INDEX_CREATED, [])?;
    conn.execute(APP_DOCS_INDEX_SESSION, [])?;

    conn.execute(APP_BLOBS_SCHEMA, [])?;

    conn.execute(AUTH_USERS_SCHEMA, [])?;
    conn.execute(AUTH_SESSIONS_SCHEMA, [])?;
    conn.execute(AUTH_SESSIONS_INDEX_EXPIRES, [])?;
    conn.execute(AUTH_STATES_SCHEMA, [])?;
    conn.execute(AUTH_STATES_INDEX_EXPIRES, [])?;
    conn.execute(AUTH_PROVIDERS_SCHEMA, [])?;
    conn.execute(AUTH_INVITES_SCHEMA, [])?;

    Ok(())
}
