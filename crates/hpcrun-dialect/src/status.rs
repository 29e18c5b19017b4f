//! Scheduler status types.

use serde::{Deserialize, Serialize};

/// Lifecycle state derived from a scheduler status literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    /// Queued, held, suspended or otherwise waiting
    Pending,
    /// Executing (including staging out / exiting)
    Running,
    /// Finished normally
    Completed,
    /// Finished abnormally (non-zero exit, node failure, wall limit, ...)
    Failed,
    /// Removed by a user or administrator
    Cancelled,
    /// Literal not in the scheduler's documented vocabulary
    Unrecognized,
}

impl SchedulerState {
    /// True for states after which the scheduler will not run the job again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerState::Completed | SchedulerState::Failed | SchedulerState::Cancelled
        )
    }
}

/// One status observation of a batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub state: SchedulerState,
    /// Raw literal as printed by the scheduler
    pub raw: String,
    /// Exit code, when the scheduler reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Result of interpreting a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusQuery {
    /// The scheduler knows the job
    Found(BackendStatus),
    /// The scheduler has no record of the job
    Absent,
    /// The query itself failed (transport, daemon down, ...)
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SchedulerState::Completed.is_terminal());
        assert!(SchedulerState::Failed.is_terminal());
        assert!(SchedulerState::Cancelled.is_terminal());
        assert!(!SchedulerState::Pending.is_terminal());
        assert!(!SchedulerState::Running.is_terminal());
        assert!(!SchedulerState::Unrecognized.is_terminal());
    }
}
