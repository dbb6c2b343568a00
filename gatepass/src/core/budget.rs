//! Attempt-scoped time budget.
//!
//! Deadlines use `tokio::time::Instant` so paused-clock tests advance them
//! together with the timers they bound.

use std::time::Duration;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tokio::time::Instant;

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO);
    if remaining.is_zero() {
        return Err(anyhow!(BudgetExhausted));
    }
    Ok(remaining)
}

/// Marker error: the attempt deadline passed before a wait could start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("attempt time budget exhausted")]
pub struct BudgetExhausted;

/// Wall-clock budget shared by every wait inside one attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptBudget {
    deadline: Instant,
}

impl AttemptBudget {
    pub fn starting_now(total: Duration) -> Self {
        Self {
            deadline: Instant::now() + total,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Result<Duration> {
        remaining_budget(self.deadline)
    }

    /// Clamp a requested wait to what is left. The flag is true when the
    /// request was cut short by the budget.
    pub fn clamp(&self, requested: Duration) -> Result<(Duration, bool)> {
        let remaining = self.remaining()?;
        if requested > remaining {
            Ok((remaining, true))
        } else {
            Ok((requested, false))
        }
    }
}
