//! Authentication companion tables, exposed only through narrow operations
//! (`spec.md` §3, §6, §7; `SPEC_FULL.md` §C.3).
//!
//! The OAuth flow itself, provider configuration, and invite redemption
//! policy belong to the external auth subsystem. This module owns the
//! tables and the lookup/CRUD primitives the spec names: user and session
//! CRUD, session validation, and single-use OAuth state tokens. Auth rows
//! are low-rate and short-lived, so writes go direct through `with_retry`
//! rather than the write queue, per `spec.md` §5's shared-resource policy.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};

use crate::context::OpContext;
use crate::error::{AuthFailure, StorageError};
use crate::substrate::Substrate;
use crate::time::{new_id, now_millis};

/// The role drawn from `{owner, admin, user}`, per `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Admin,
    User,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    fn parse(raw: &str) -> Result<Self, StorageError> {
        match raw {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(StorageError::Internal(format!("unknown role in storage: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub user_id: String,
    pub role: Role,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Hashes a bearer token with SHA-256 before it ever touches storage or a
/// log line; only the hash is persisted or compared.
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// The authentication companion surface over a shared substrate.
pub struct AuthStore {
    substrate: Arc<Substrate>,
}

impl AuthStore {
    pub fn new(substrate: Arc<Substrate>) -> Self {
        Self { substrate }
    }

    /// Creates a new user with `role`. Fails with `AuthFailure::UserExists`
    /// if `user_id` is already taken.
    pub fn create_user(&self, ctx: &OpContext, user_id: &str, role: Role) -> Result<User, StorageError> {
        let now = now_millis();
        let user_id = user_id.to_string();
        self.substrate.with_retry(ctx, |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO auth_users (user_id, role, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![user_id, role.as_str(), now],
            )?;
            if inserted == 0 {
                return Err(AuthFailure::UserExists.into());
            }
            Ok(())
        })?;

        Ok(User {
            user_id,
            role,
            created_at: now,
            updated_at: now,
        })
    }

    /// Looks up a user by id, or `AuthFailure::UserNotFound`.
    pub fn find_user(&self, ctx: &OpContext, user_id: &str) -> Result<User, StorageError> {
        self.substrate.with_retry(ctx, |conn| {
            conn.query_row(
                "SELECT user_id, role, created_at, updated_at FROM auth_users WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(StorageError::from)
            .and_then(|opt| opt.ok_or_else(|| AuthFailure::UserNotFound.into()))
            .and_then(|(user_id, role, created_at, updated_at)| {
                Ok(User {
                    user_id,
                    role: Role::parse(&role)?,
                    created_at,
                    updated_at,
                })
            })
        })
    }

    /// Mints a session for `user_id` valid for `ttl_ms`, returning the raw
    /// (unhashed) token to hand to the caller. Only the hash is stored.
    pub fn create_session(&self, ctx: &OpContext, user_id: &str, ttl_ms: i64) -> Result<String, StorageError> {
        let token = new_id();
        let token_hash = hash_token(&token);
        let now = now_millis();
        let expires_at = now + ttl_ms;
        let user_id = user_id.to_string();

        self.substrate.with_retry(ctx, |conn| {
            conn.execute(
                "INSERT INTO auth_sessions (token_hash, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![token_hash, user_id, now, expires_at],
            )?;
            Ok(())
        })?;

        Ok(token)
    }

    /// Maps a raw bearer token to its authenticated user, per `spec.md`
    /// §6's collaborator interface. Fails with `InvalidSession` if the
    /// token is unknown, `SessionExpired` if its expiry has passed.
    pub fn validate_session(&self, ctx: &OpContext, token: &str) -> Result<User, StorageError> {
        let token_hash = hash_token(token);
        let now = now_millis();

        let user_id = self.substrate.with_retry(ctx, |conn| {
            conn.query_row(
                "SELECT user_id, expires_at FROM auth_sessions WHERE token_hash = ?1",
                rusqlite::params![token_hash],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(StorageError::from)
            .and_then(|opt| opt.ok_or_else(|| AuthFailure::InvalidSession.into()))
            .and_then(|(user_id, expires_at)| {
                if expires_at <= now {
                    Err(AuthFailure::SessionExpired.into())
                } else {
                    Ok(user_id)
                }
            })
        })?;

        self.find_user(ctx, &user_id)
    }

    /// Revokes a session by its raw token. A no-op if the token is
    /// already unknown.
    pub fn revoke_session(&self, ctx: &OpContext, token: &str) -> Result<(), StorageError> {
        let token_hash = hash_token(token);
        self.substrate.with_retry(ctx, |conn| {
            conn.execute("DELETE FROM auth_sessions WHERE token_hash = ?1", rusqlite::params![token_hash])?;
            Ok(())
        })
    }

    /// Creates a single-use OAuth pending state for `provider`, expiring
    /// after `ttl_ms`. `payload` is an opaque string the caller later gets
    /// back verbatim from `consume_oauth_state`.
    pub fn create_oauth_state(&self, ctx: &OpContext, provider: &str, payload: &str, ttl_ms: i64) -> Result<String, StorageError> {
        let token = new_id();
        let expires_at = now_millis() + ttl_ms;
        let provider = provider.to_string();
        let payload = payload.to_string();
        let token_for_insert = token.clone();

        self.substrate.with_retry(ctx, |conn| {
            conn.execute(
                "INSERT INTO auth_states (token, provider, payload, expires_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![token_for_insert, provider, payload, expires_at],
            )?;
            Ok(())
        })?;

        Ok(token)
    }

    /// Consumes a pending OAuth state token: deletes it and returns its
    /// `(provider, payload)`, or `InvalidState` if unknown or expired.
    pub fn consume_oauth_state(&self, ctx: &OpContext, token: &str) -> Result<(String, String), StorageError> {
        let now = now_millis();
        let token = token.to_string();
        self.substrate.with_retry(ctx, |conn| {
            let row = conn
                .query_row(
                    "SELECT provider, payload, expires_at FROM auth_states WHERE token = ?1",
                    rusqlite::params![token],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)),
                )
                .optional()?;

            let Some((provider, payload, expires_at)) = row else {
                return Err(AuthFailure::InvalidState.into());
            };

            conn.execute("DELETE FROM auth_states WHERE token = ?1", rusqlite::params![token])?;

            if expires_at <= now {
                return Err(AuthFailure::InvalidState.into());
            }
            Ok((provider, payload))
        })
    }

    /// Deletes every expired session and OAuth state row. Invoked by the
    /// background sweeper per `spec.md`'s cleanup-daemon responsibility.
    pub fn sweep_expired(&self, ctx: &OpContext) -> Result<usize, StorageError> {
        let now = now_millis();
        self.substrate.with_retry(ctx, |conn| {
            let sessions = conn.execute("DELETE FROM auth_sessions WHERE expires_at <= ?1", rusqlite::params![now])?;
            let states = conn.execute("DELETE FROM auth_states WHERE expires_at <= ?1", rusqlite::params![now])?;
            Ok(sessions + states)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn new_store() -> AuthStore {
        let config = StorageConfig::default();
        let substrate = Arc::new(Substrate::open_in_memory(&config).unwrap());
        AuthStore::new(substrate)
    }

    #[test]
    fn create_then_find_user_round_trips() {
        let store = new_store();
        let ctx = OpContext::background();
        store.create_user(&ctx, "u1", Role::Owner).unwrap();
        let found = store.find_user(&ctx, "u1").unwrap();
        assert_eq!(found.role, Role::Owner);
    }

    #[test]
    fn duplicate_user_id_fails() {
        let store = new_store();
        let ctx = OpContext::background();
        store.create_user(&ctx, "u1", Role::User).unwrap();
        let err = store.create_user(&ctx, "u1", Role::User).unwrap_err();
        assert!(matches!(err, StorageError::AuthFailure(AuthFailure::UserExists)));
    }

    #[test]
    fn unknown_user_not_found() {
        let store = new_store();
        let ctx = OpContext::background();
        let err = store.find_user(&ctx, "ghost").unwrap_err();
        assert!(matches!(err, StorageError::AuthFailure(AuthFailure::UserNotFound)));
    }

    #[test]
    fn session_validates_to_its_user() {
        let store = new_store();
        let ctx = OpContext::background();
        store.create_user(&ctx, "u1", Role::Admin).unwrap();
        let token = store.create_session(&ctx, "u1", 60_000).unwrap();
        let user = store.validate_session(&ctx, &token).unwrap();
        assert_eq!(user.user_id, "u1");
    }

    #[test]
    fn expired_session_fails() {
        let store = new_store();
        let ctx = OpContext::background();
        store.create_user(&ctx, "u1", Role::User).unwrap();
        let token = store.create_session(&ctx, "u1", -1).unwrap();
        let err = store.validate_session(&ctx, &token).unwrap_err();
        assert!(matches!(err, StorageError::AuthFailure(AuthFailure::SessionExpired)));
    }

    #[test]
    fn unknown_session_is_invalid() {
        let store = new_store();
        let ctx = OpContext::background();
        let err = store.validate_session(&ctx, "bogus").unwrap_err();
        assert!(matches!(err, StorageError::AuthFailure(AuthFailure::InvalidSession)));
    }

    #[test]
    fn revoke_session_invalidates_it() {
        let store = new_store();
        let ctx = OpContext::background();
        store.create_user(&ctx, "u1", Role::User).unwrap();
        let token = store.create_session(&ctx, "u1", 60_000).unwrap();
        store.revoke_session(&ctx, &token).unwrap();
        assert!(store.validate_session(&ctx, &token).is_err());
    }

    #[test]
    fn oauth_state_round_trips_and_is_single_use() {
        let store = new_store();
        let ctx = OpContext::background();
        let token = store.create_oauth_state(&ctx, "github", "redirect=foo", 60_000).unwrap();
        let (provider, payload) = store.consume_oauth_state(&ctx, &token).unwrap();
        assert_eq!(provider, "github");
        assert_eq!(payload, "redirect=foo");
        let err = store.consume_oauth_state(&ctx, &token).unwrap_err();
        assert!(matches!(err, StorageError::AuthFailure(AuthFailure::InvalidState)));
    }

    #[test]
    fn sweep_removes_expired_sessions_and_states() {
        let store = new_store();
        let ctx = OpContext::background();
        store.create_user(&ctx, "u1", Role::User).unwrap();
        store.create_session(&ctx, "u1", -1).unwrap();
        store.create_oauth_state(&ctx, "github", "x", -1).unwrap();
        let removed = store.sweep_expired(&ctx).unwrap();
        assert_eq!(removed, 2);
    }
}
