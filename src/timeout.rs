//! Time budgets shared across the steps of one logical operation.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::{FramingError, Result};

/// A single deadline consumed by several sequential operations.
///
/// `Duration::MAX` (or any duration that overflows the clock) means no
/// deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutHelper {
    original: Duration,
    deadline: Option<Instant>,
}

impl TimeoutHelper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            original: timeout,
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// A helper that never expires.
    pub fn infinite() -> Self {
        Self {
            original: Duration::MAX,
            deadline: None,
        }
    }

    /// The budget this helper was created with.
    #[inline]
    pub fn original(&self) -> Duration {
        self.original
    }

    /// Remaining budget, or `Err(Timeout)` once the deadline has passed.
    pub fn remaining(&self) -> Result<Duration> {
        match self.deadline {
            None => Ok(Duration::MAX),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(FramingError::Timeout(self.original))
                } else {
                    Ok(deadline - now)
                }
            }
        }
    }

    /// Remaining budget, clamped at zero.
    pub fn remaining_or_zero(&self) -> Duration {
        self.remaining().unwrap_or(Duration::ZERO)
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_err()
    }
}
