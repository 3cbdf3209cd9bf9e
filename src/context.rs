//! Per-operation cancellation and deadline context.
//!
//! `spec.md` describes every operation as carrying a `ctx` with a deadline
//! and cooperative cancellation, in the idiom of Go's `context.Context`.
//! Rust has no ambient equivalent, so `OpContext` models the two things the
//! spec actually needs from it: an optional deadline, and a cancellation
//! flag the caller and the write queue both observe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A cooperative deadline/cancellation handle passed to every storage
/// operation.
///
/// Cloning an `OpContext` shares the same cancellation flag — cancelling
/// any clone cancels all of them, matching how a Go context cancellation
/// propagates to every derived child.
#[derive(Debug, Clone)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl OpContext {
    /// A context with no deadline and no cancellation — suitable for
    /// background sweepers and tests that don't exercise admission control.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context that expires after `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context with an explicit deadline instant.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining until the deadline, or `None` if there is none.
    /// A context whose deadline has already passed returns `Some(ZERO)`.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Derives a child context whose deadline is the earlier of this
    /// context's deadline and `now + budget`. Shares this context's
    /// cancellation flag, per `spec.md` §4.8.
    pub fn narrowed_to(&self, budget: Duration) -> Self {
        let candidate = Instant::now().checked_add(budget);
        let deadline = match (self.deadline, candidate) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        Self {
            deadline,
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// Marks this context (and every clone sharing its flag) cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True once the deadline has passed, independent of `is_cancelled`.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn background_never_expires() {
        let ctx = OpContext::background();
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_expired());
    }

    #[test]
    fn timeout_expires_after_duration() {
        let ctx = OpContext::with_timeout(Duration::from_millis(10));
        assert!(!ctx.is_expired());
        sleep(Duration::from_millis(30));
        assert!(ctx.is_expired());
    }

    #[test]
    fn narrowed_to_picks_the_earlier_deadline() {
        let ctx = OpContext::with_timeout(Duration::from_secs(10));
        let narrowed = ctx.narrowed_to(Duration::from_millis(1));
        assert!(narrowed.remaining().unwrap() <= Duration::from_secs(10));
        assert!(narrowed.remaining().unwrap() < ctx.remaining().unwrap());
    }

    #[test]
    fn cancel_is_shared_across_clones() {
        let ctx = OpContext::background();
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());
        ctx.cancel();
        assert!(clone.is_cancelled());
    }
}
