//! Per-request deadline budget (`spec.md` §4.8).
//!
//! A request arrives with an upper-bound wall-clock duration. The budget
//! tracks how much of it remains and derives the [`OpContext`] each storage
//! operation actually runs under, so that no single operation can outlive
//! the request, and a caller that has already burned its budget is told to
//! stop before touching the substrate.

use std::time::{Duration, Instant};

use crate::context::OpContext;
use crate::error::StorageError;

/// The per-operation floor from `spec.md` §4.8: if the remaining budget is
/// below this, admission fails with `InsufficientTime` before the
/// operation is even attempted.
pub const OPERATION_FLOOR: Duration = Duration::from_millis(500);

/// Tracks the wall-clock envelope of one incoming tenant request.
#[derive(Debug, Clone)]
pub struct RequestBudget {
    start: Instant,
    total: Duration,
    floor: Duration,
}

impl RequestBudget {
    /// Starts a new budget of `total` duration, using the spec's default
    /// per-operation floor.
    pub fn new(total: Duration) -> Self {
        Self::with_floor(total, OPERATION_FLOOR)
    }

    pub fn with_floor(total: Duration, floor: Duration) -> Self {
        Self {
            start: Instant::now(),
            total,
            floor,
        }
    }

    /// Time left in the request's budget, saturating at zero.
    pub fn remaining(&self) -> Duration {
        let elapsed = self.start.elapsed();
        self.total.saturating_sub(elapsed)
    }

    /// Whether a new storage operation may still begin: the remaining
    /// budget must clear the per-operation floor.
    pub fn can_start_operation(&self) -> Result<(), StorageError> {
        if self.remaining() < self.floor {
            return Err(StorageError::InsufficientTime);
        }
        Ok(())
    }

    /// Derives a child context for one storage operation: a deadline equal
    /// to `min(parent.deadline, now + remaining)`, per `spec.md` §4.8.
    pub fn storage_context(&self, parent: &OpContext) -> Result<OpContext, StorageError> {
        self.can_start_operation()?;
        Ok(parent.narrowed_to(self.remaining()))
    }
}
