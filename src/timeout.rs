//! Polling cadence and pending-time budget
//!
//! Every executor carries two numbers:
//! - `poll_interval_seconds`: how often an asynchronous job is queried
//! - `max_pending_seconds`: how long after submission a job may remain
//!   non-terminal before it is timed out and cancelled at its backend
//!
//! The budget is measured from the job's recorded `submit_time`, so it keeps
//! its meaning when a job record is reloaded. The budget does NOT cancel
//! anything itself; the poller acts on the result of [`PendingBudget::check`].

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 30;

/// Default pending budget (seconds)
pub const DEFAULT_MAX_PENDING_SECONDS: u64 = 3600;

/// Upper bound for the poll interval (one day)
pub const MAX_POLL_INTERVAL_SECONDS: u64 = 86_400;

/// Upper bound for the pending budget (one week)
pub const MAX_PENDING_SECONDS: u64 = 604_800;

/// Poll configuration of one executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub poll_interval_seconds: u64,
    pub max_pending_seconds: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            max_pending_seconds: DEFAULT_MAX_PENDING_SECONDS,
        }
    }
}

impl PollConfig {
    /// Validate against the allowed bounds
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        if self.poll_interval_seconds == 0 || self.poll_interval_seconds > MAX_POLL_INTERVAL_SECONDS
        {
            return Err(TimeoutValidationError::PollIntervalOutOfBounds {
                value: self.poll_interval_seconds,
            });
        }

        if self.max_pending_seconds == 0 || self.max_pending_seconds > MAX_PENDING_SECONDS {
            return Err(TimeoutValidationError::MaxPendingOutOfBounds {
                value: self.max_pending_seconds,
            });
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

/// Timeout validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("poll_interval_seconds must be in (0, 86400], got {value}")]
    PollIntervalOutOfBounds { value: u64 },

    #[error("max_pending_seconds must be in (0, 604800], got {value}")]
    MaxPendingOutOfBounds { value: u64 },
}

/// Budget check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Still within budget
    Ok,
    /// Budget exhausted
    Exceeded {
        elapsed_seconds: i64,
        budget_seconds: u64,
    },
}

impl BudgetStatus {
    pub fn is_exceeded(&self) -> bool {
        matches!(self, BudgetStatus::Exceeded { .. })
    }
}

/// Pending-time budget of one submitted job
#[derive(Debug, Clone, Copy)]
pub struct PendingBudget {
    submitted_at: DateTime<Utc>,
    budget_seconds: u64,
}

impl PendingBudget {
    pub fn new(submitted_at: DateTime<Utc>, budget_seconds: u64) -> Self {
        Self {
            submitted_at,
            budget_seconds,
        }
    }

    /// Whole seconds elapsed since submission at `now`
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.submitted_at).num_seconds()
    }

    /// Check the budget at `now`. The budget is exceeded strictly after
    /// `max_pending_seconds` have passed.
    pub fn check(&self, now: DateTime<Utc>) -> BudgetStatus {
        let elapsed = now - self.submitted_at;
        if elapsed.num_milliseconds() > (self.budget_seconds as i64) * 1000 {
            BudgetStatus::Exceeded {
                elapsed_seconds: elapsed.num_seconds(),
                budget_seconds: self.budget_seconds,
            }
        } else {
            BudgetStatus::Ok
        }
    }

    /// Time left before the budget is exhausted
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let left_ms = (self.budget_seconds as i64) * 1000 - (now - self.submitted_at).num_milliseconds();
        Duration::from_millis(left_ms.max(0) as u64)
    }
}
