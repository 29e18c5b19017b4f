//! Job state machine
//!
//! Job states: CREATED → SUBMITTED → [PENDING] → RUNNING → COMPLETED,
//! with TIMEOUT, CANCELLED, FAILED_TO_SUBMIT and POLL_ERROR as terminal
//! failure states. Transitions only move forward.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

use super::TerminalState;

/// Job state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Job record allocated, nothing handed to a backend yet
    Created,
    /// Backend accepted the job
    Submitted,
    /// Batch scheduler reports the job as queued or held
    Pending,
    /// Backend reports the job as executing
    Running,
    /// Backend finished the job; carries a verdict
    Completed,
    /// Pending-time budget exhausted before the backend finished
    Timeout,
    /// Cancelled by the run or by an operator at the backend
    Cancelled,
    /// Backend rejected the submission
    FailedToSubmit,
    /// Status queries failed too many times in a row
    PollError,
}

impl TerminalState for JobState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Timeout
                | JobState::Cancelled
                | JobState::FailedToSubmit
                | JobState::PollError
        )
    }
}

impl JobState {
    /// All states, in rank order.
    pub const ALL: [JobState; 9] = [
        JobState::Created,
        JobState::Submitted,
        JobState::Pending,
        JobState::Running,
        JobState::Completed,
        JobState::Timeout,
        JobState::Cancelled,
        JobState::FailedToSubmit,
        JobState::PollError,
    ];

    /// Position in the lifecycle. Terminal states share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Created => 0,
            JobState::Submitted => 1,
            JobState::Pending => 2,
            JobState::Running => 3,
            _ => 4,
        }
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: JobState) -> bool {
        match (self, target) {
            // Repeated "still queued" polls
            (JobState::Pending, JobState::Pending) => true,

            // Only a submission attempt can fail to submit
            (JobState::Created, JobState::FailedToSubmit) => true,
            (_, JobState::FailedToSubmit) => false,

            (from, to) => !from.is_terminal() && to.rank() > from.rank(),
        }
    }

    /// Upper-case wire name, as stored in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Submitted => "SUBMITTED",
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Timeout => "TIMEOUT",
            JobState::Cancelled => "CANCELLED",
            JobState::FailedToSubmit => "FAILED_TO_SUBMIT",
            JobState::PollError => "POLL_ERROR",
        }
    }

    /// Parse a wire name, case-insensitively.
    pub fn parse(value: &str) -> Option<JobState> {
        let upper = value.to_ascii_uppercase();
        JobState::ALL.iter().copied().find(|s| s.as_str() == upper)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors for job state operations
#[derive(Debug, thiserror::Error)]
pub enum JobStateError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
