//! Process-start configuration for the storage core.
//!
//! `spec.md` §6 "Operational configuration" fixes every constant below as a
//! value set once at process start; this struct is the single place they
//! live, threaded into the write queue and engines at construction time
//! instead of read from global state (the lone exception is documented on
//! [`crate::substrate::Substrate`]).

use std::time::Duration;

/// Tunables for the write queue, retry policy, KV cache, and sweepers.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bounded channel capacity for the write queue. Default 1000.
    pub queue_capacity: usize,
    /// Estimated wall-clock cost of one queued write, used by admission
    /// control. Default 30ms.
    pub queue_wait_estimate: Duration,
    /// Minimum remaining deadline an operation must have after absorbing
    /// its estimated wait, or admission fails with `InsufficientTime`.
    /// Default 500ms.
    pub admission_floor: Duration,
    /// Maximum `with_retry` attempts on a transient substrate error.
    /// Default 5.
    pub retry_attempts: u32,
    /// Initial backoff before the first retry; doubles each attempt.
    /// Default 20ms.
    pub retry_initial_backoff: Duration,
    /// Maximum number of entries held in the KV read cache. Default 1000.
    pub kv_cache_capacity: usize,
    /// Interval between KV TTL / auth-companion expiry sweeps. Default 5
    /// minutes.
    pub sweep_interval: Duration,
    /// Whether this process is running in local/dev mode, gating the
    /// dev-only surfaces named in `spec.md` §6.
    pub local_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            queue_wait_estimate: Duration::from_millis(30),
            admission_floor: Duration::from_millis(500),
            retry_attempts: 5,
            retry_initial_backoff: Duration::from_millis(20),
            kv_cache_capacity: 1000,
            sweep_interval: Duration::from_secs(5 * 60),
            local_mode: false,
        }
    }
}

impl StorageConfig {
    /// The "is local-mode" predicate from `spec.md` §6, exposed to the
    /// HTTP/auth collaborator to gate dev-only surfaces.
    pub fn is_local_mode(&self) -> bool {
        self.local_mode
    }
}
