//! Background cleanup daemons (`spec.md` overview: "Periodic expiry of TTL
//! entries and of process-wide ephemeral state (sessions, OAuth pending
//! states)").
//!
//! One timer thread runs both sweeps on [`StorageConfig::sweep_interval`]
//! (default 5 minutes), matching the teacher's single-purpose background
//! thread shape rather than a task scheduler. Sweep errors are logged and
//! swallowed — a failed sweep should never bring down the process, it
//! simply tries again next interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::auth::AuthStore;
use crate::context::OpContext;
use crate::kv::KvEngine;

/// Handle to the background sweeper thread. Dropping it stops the thread
/// at the next wakeup.
pub struct CleanupDaemon {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupDaemon {
    /// Spawns the sweep loop. `kv` and `auth` are swept every `interval`.
    pub fn spawn(kv: Arc<KvEngine>, auth: Arc<AuthStore>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let ctx = OpContext::background();
            while !worker_stop.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if worker_stop.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = kv.sweep_expired(&ctx) {
                    eprintln!("[storage-core] kv ttl sweep failed: {err}");
                }
                if let Err(err) = auth.sweep_expired(&ctx) {
                    eprintln!("[storage-core] auth companion sweep failed: {err}");
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the sweep loop and waits for the thread to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CleanupDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}
