//! Canonical error type for the storage core.
//!
//! Every engine and the write queue return `Result<T, StorageError>`. The
//! variants here are the stable error kinds from the storage core's error
//! taxonomy: callers (the binding façade, the HTTP host) match on these to
//! decide whether to retry, surface a user error, or propagate verbatim.

use thiserror::Error;

/// Canonical error type for all storage-core operations.
///
/// `NotFound` is deliberately absent: single-value lookups (`kv::get`,
/// `documents::find_one`, `blobs::get`) return `Option<T>` instead of this
/// error, per the storage core's error taxonomy. `NotFound` only appears
/// here for operations with no natural `Option` return (`Copy` of a
/// missing source blob).
#[derive(Error, Debug)]
pub enum StorageError {
    /// Argument type/shape/count violation, unknown query/update operator,
    /// non-object doc/query/changes, or a path with illegal characters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced source of a `Copy`/`Move` does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Admission was rejected because the write queue is at capacity.
    /// Retryable.
    #[error("write queue full")]
    QueueFull,

    /// Admission was rejected because the remaining deadline cannot absorb
    /// the estimated wait plus the per-operation floor. Retryable.
    #[error("insufficient time remaining for operation")]
    InsufficientTime,

    /// The caller's context was cancelled during queue wait, retry
    /// backoff, or execution. Not retryable by the core; propagate as-is.
    #[error("operation cancelled")]
    Cancelled,

    /// The substrate returned an error after exhausting internal retries.
    /// `source` carries the underlying SQLite error text.
    #[error("storage error: {source}")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },

    /// Authentication companion failure (`spec.md` §7 `AuthFailure`).
    #[error("auth failure: {0}")]
    AuthFailure(#[from] AuthFailure),

    /// An internal invariant was violated (e.g. a row vanished between an
    /// insert and its immediate reload). Indicates a bug, not tenant input.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Authentication-companion error kinds, named individually per `spec.md`
/// §7 so callers can match on the specific failure rather than a string.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("invalid session")]
    InvalidSession,
    #[error("session expired")]
    SessionExpired,
    #[error("user not found")]
    UserNotFound,
    #[error("user exists")]
    UserExists,
    #[error("provider disabled")]
    ProviderDisabled,
    #[error("invalid state")]
    InvalidState,
    #[error("invalid invite")]
    InvalidInvite,
    #[error("invite used")]
    InviteUsed,
}

impl From<rusqlite::Error> for StorageError {
    fn from(source: rusqlite::Error) -> Self {
        StorageError::Storage { source }
    }
}

/// Corrupt JSON in a stored document is reported as `InvalidArgument` on the
/// read path, per `spec.md` §7 "Fatal conditions" — not a distinct error
/// kind, since callers already match on `InvalidArgument` for malformed
/// input and a corrupt row is indistinguishable from bad input to them.
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidArgument(format!("corrupt stored document: {err}"))
    }
}

impl StorageError {
    /// Whether a caller may retry the operation as-is (with backoff).
    /// Mirrors `spec.md` §7's propagation policy: admission failures are
    /// retryable, cancellation and argument errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::QueueFull | StorageError::InsufficientTime)
    }
}
