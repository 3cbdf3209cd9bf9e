//! The bounded single-writer write queue (`spec.md` §4.2).
//!
//! A FIFO channel drained by exactly one worker thread, which is the sole
//! mutator of the substrate. This is the invariant that makes the
//! substrate's single connection safe under concurrent request load: every
//! mutating engine call goes through [`WriteQueue::submit`] instead of
//! touching the substrate directly.
//!
//! The bounded `mpsc::sync_channel` of boxed closures and the one-shot reply
//! channel per submission are the teacher's own stdlib-actor idiom, e.g. the
//! one-shot worker `run_validation_bounded()` spawns in `src/lib.rs` (a
//! `thread::spawn` paired with an `mpsc::channel` reply and a timeout on
//! `recv_timeout`). This queue generalizes that one-shot shape into a
//! persistent dispatch loop plus the admission-control check the teacher's
//! helper doesn't need, and adds panic containment: a job panic is caught at
//! the worker boundary, logged, and the worker thread is respawned on a
//! fresh channel rather than left dead (`spec.md` §7 "Fatal conditions").

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::context::OpContext;
use crate::error::StorageError;
use crate::substrate::Substrate;

type Job = Box<dyn FnOnce(&Substrate) -> Result<(), StorageError> + Send>;

struct Envelope {
    ctx: OpContext,
    job: Job,
    reply: mpsc::Sender<Result<(), StorageError>>,
}

/// Point-in-time occupancy of the write queue, per `spec.md` §4.2 `Stats()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
}

impl QueueStats {
    /// Fraction of capacity currently occupied, in `[0.0, 1.0]`.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.depth as f64 / self.capacity as f64
        }
    }
}

/// The single-writer queue in front of the substrate.
pub struct WriteQueue {
    sender: Arc<Mutex<Option<SyncSender<Envelope>>>>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
    wait_estimate: Duration,
    admission_floor: Duration,
    stopped: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    /// Spawns the supervisor thread and returns a handle bound to `substrate`.
    pub fn new(
        substrate: Arc<Substrate>,
        capacity: usize,
        wait_estimate: Duration,
        admission_floor: Duration,
    ) -> Self {
        let depth = Arc::new(AtomicUsize::new(0));
        let sender = Arc::new(Mutex::new(None));
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = {
            let substrate = Arc::clone(&substrate);
            let depth = Arc::clone(&depth);
            let sender = Arc::clone(&sender);
            let stopped = Arc::clone(&stopped);
            let capacity = capacity.max(1);
            std::thread::spawn(move || Self::run_supervisor(substrate, capacity, sender, depth, stopped))
        };

        Self {
            sender,
            depth,
            capacity: capacity.max(1),
            wait_estimate,
            admission_floor,
            stopped,
            supervisor: Mutex::new(Some(handle)),
        }
    }

    /// Runs the worker, respawning it on a fresh channel if a job panics.
    /// The old channel's sender is swapped out first so in-flight `submit`
    /// calls never race a closed one, then the worker drains what's left
    /// under the new generation.
    fn run_supervisor(
        substrate: Arc<Substrate>,
        capacity: usize,
        sender_slot: Arc<Mutex<Option<SyncSender<Envelope>>>>,
        depth: Arc<AtomicUsize>,
        stopped: Arc<AtomicBool>,
    ) {
        while !stopped.load(Ordering::SeqCst) {
            let (sender, receiver) = mpsc::sync_channel::<Envelope>(capacity);
            *sender_slot.lock().expect("queue sender mutex poisoned") = Some(sender);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                Self::run_worker(&substrate, &receiver, &depth);
            }));

            if let Err(payload) = outcome {
                eprintln!(
                    "[storage-core] write queue worker thread panicked, restarting: {}",
                    panic_message(&payload)
                );
                continue;
            }

            // run_worker only returns (without panicking) once its channel
            // disconnects, which only happens via close(); time to stop.
            break;
        }
    }

    /// Drains `receiver` until its channel disconnects. A panic inside an
    /// individual job is caught here rather than propagated, so one bad job
    /// can't take the whole worker down: it's reported to the submitter as
    /// `StorageError::Internal` and logged, and the loop continues with the
    /// next envelope.
    fn run_worker(substrate: &Substrate, receiver: &Receiver<Envelope>, depth: &AtomicUsize) {
        while let Ok(envelope) = receiver.recv() {
            depth.fetch_sub(1, Ordering::SeqCst);
            let Envelope { ctx, job, reply } = envelope;

            let result = if ctx.is_cancelled() {
                Err(StorageError::Cancelled)
            } else {
                match panic::catch_unwind(AssertUnwindSafe(|| job(substrate))) {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(&payload);
                        eprintln!("[storage-core] write queue job panicked: {message}");
                        Err(StorageError::Internal(format!("write queue job panicked: {message}")))
                    }
                }
            };

            // The submitter may have already given up on its reply; a
            // dispatched closure still runs to completion (spec.md §5), its
            // result simply has nowhere left to go.
            let _ = reply.send(result);
        }
    }

    /// Submits `job` for the single writer to run, honoring admission
    /// control, queue capacity, and `ctx` cancellation during the wait.
    pub fn submit<F>(&self, ctx: &OpContext, job: F) -> Result<(), StorageError>
    where
        F: FnOnce(&Substrate) -> Result<(), StorageError> + Send + 'static,
    {
        self.check_admission(ctx)?;

        let (reply_tx, reply_rx) = mpsc::channel();
        let envelope = Envelope {
            ctx: ctx.clone(),
            job: Box::new(job),
            reply: reply_tx,
        };

        let sender = self
            .sender
            .lock()
            .expect("queue sender mutex poisoned")
            .clone()
            .ok_or(StorageError::Internal("write queue closed".into()))?;

        match sender.try_send(envelope) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => return Err(StorageError::QueueFull),
        }

        self.wait_for_reply(ctx, reply_rx)
    }

    fn check_admission(&self, ctx: &OpContext) -> Result<(), StorageError> {
        let Some(remaining) = ctx.remaining() else {
            return Ok(());
        };
        let depth = self.depth.load(Ordering::SeqCst);
        let estimated_wait = self.wait_estimate.saturating_mul(depth as u32);
        if remaining < estimated_wait + self.admission_floor {
            return Err(StorageError::InsufficientTime);
        }
        Ok(())
    }

    fn wait_for_reply(
        &self,
        ctx: &OpContext,
        reply_rx: mpsc::Receiver<Result<(), StorageError>>,
    ) -> Result<(), StorageError> {
        loop {
            let poll = match ctx.remaining() {
                Some(remaining) => reply_rx.recv_timeout(remaining.min(Duration::from_millis(20))),
                None => reply_rx.recv_timeout(Duration::from_millis(20)),
            };

            match poll {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if ctx.is_cancelled() || ctx.is_expired() {
                        return Err(StorageError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StorageError::Internal("write queue worker stopped".into()));
                }
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth.load(Ordering::SeqCst),
            capacity: self.capacity,
        }
    }

    /// Stops accepting new work and waits for the worker to drain the
    /// channel and exit.
    pub fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let sender = self.sender.lock().expect("queue sender mutex poisoned").take();
        drop(sender);
        let handle = self.supervisor.lock().expect("supervisor mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Extracts a human-readable message from a caught panic payload, falling
/// back to a generic description for payloads that aren't `&str`/`String`.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.close();
    }
}
