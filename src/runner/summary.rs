//! Build summary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobState, Verdict};
use crate::signal::EXIT_CODE_CANCELLED;
use crate::store::BuildState;

/// Aggregated outcome of one build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub build_id: u64,
    pub state: BuildState,
    pub created_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub failed_to_submit: usize,
    pub poll_errors: usize,
    pub duration_ms: u64,
    pub human_summary: String,
}

impl BuildSummary {
    pub fn from_jobs(build_id: u64, state: BuildState, jobs: &[Job], duration_ms: u64) -> Self {
        let mut summary = Self {
            build_id,
            state,
            created_at: Utc::now(),
            total: jobs.len(),
            passed: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
            failed_to_submit: 0,
            poll_errors: 0,
            duration_ms,
            human_summary: String::new(),
        };

        for job in jobs {
            match job.state {
                JobState::Completed if job.verdict == Some(Verdict::Pass) => summary.passed += 1,
                JobState::Completed => summary.failed += 1,
                JobState::Timeout => summary.timed_out += 1,
                JobState::Cancelled => summary.cancelled += 1,
                JobState::FailedToSubmit => summary.failed_to_submit += 1,
                JobState::PollError => summary.poll_errors += 1,
                // Never finalized in a non-terminal state
                JobState::Created
                | JobState::Submitted
                | JobState::Pending
                | JobState::Running => summary.failed += 1,
            }
        }

        summary.human_summary = summary.generate_human_summary();
        summary
    }

    /// Whether every job passed
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    /// Process exit code: 0 all passed, 80 cancelled, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.state {
            BuildState::Cancelled => EXIT_CODE_CANCELLED,
            BuildState::Complete if self.all_passed() => 0,
            _ => 1,
        }
    }

    fn generate_human_summary(&self) -> String {
        if self.total == 0 {
            return format!("Build {}: no tests run", self.build_id);
        }

        let mut parts = vec![format!("{}/{} passed", self.passed, self.total)];
        for (count, label) in [
            (self.failed, "failed"),
            (self.timed_out, "timed out"),
            (self.cancelled, "cancelled"),
            (self.failed_to_submit, "failed to submit"),
            (self.poll_errors, "lost to poll errors"),
        ] {
            if count > 0 {
                parts.push(format!("{} {}", count, label));
            }
        }

        let prefix = match self.state {
            BuildState::Cancelled => "cancelled",
            BuildState::Aborted => "aborted",
            _ => "finished",
        };
        format!("Build {} {}: {}", self.build_id, prefix, parts.join(", "))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
