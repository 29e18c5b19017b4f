//! Run-level cancellation
//!
//! When a run is interrupted every job that is not yet terminal is stopped:
//! batch jobs get a best-effort cancel request at their scheduler, local and
//! container processes are signalled by their waiting worker, and the job is
//! marked CANCELLED. Jobs that already finished are left alone.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::ExecutionBackend;
use crate::job::{BackendJobId, Job, JobState};

/// Cancellation result for a single job
#[derive(Debug, Clone)]
pub struct JobCancellation {
    pub job_id: Uuid,
    pub test_name: String,
    pub backend_job_id: Option<BackendJobId>,
    /// Whether the backend accepted the cancel request
    pub backend_acknowledged: bool,
    /// Whether the job was already in a terminal state
    pub already_terminal: bool,
    /// Error message if the backend refused
    pub error: Option<String>,
}

impl JobCancellation {
    /// Result for a job that was already terminal
    pub fn already_terminal(job: &Job) -> Self {
        Self {
            job_id: job.id,
            test_name: job.test_name.clone(),
            backend_job_id: job.backend_job_id.clone(),
            backend_acknowledged: false,
            already_terminal: true,
            error: None,
        }
    }
}

/// Cancellation results for one build
#[derive(Debug)]
pub struct RunCancellation {
    pub build_id: u64,
    pub jobs: Vec<JobCancellation>,
    /// Jobs whose backend accepted the cancel request
    pub cancelled_count: usize,
    /// Jobs whose backend refused or could not be reached
    pub failed_count: usize,
    pub already_terminal_count: usize,
}

impl RunCancellation {
    pub fn new(build_id: u64) -> Self {
        Self {
            build_id,
            jobs: Vec::new(),
            cancelled_count: 0,
            failed_count: 0,
            already_terminal_count: 0,
        }
    }

    pub fn add(&mut self, result: JobCancellation) {
        if result.already_terminal {
            self.already_terminal_count += 1;
        } else if result.error.is_some() {
            self.failed_count += 1;
        } else {
            self.cancelled_count += 1;
        }
        self.jobs.push(result);
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = JobCancellation>) {
        for result in results {
            self.add(result);
        }
    }

    /// Whether every backend accepted its cancel request
    pub fn all_succeeded(&self) -> bool {
        self.failed_count == 0
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        let total = self.jobs.len();
        if total == 0 {
            return format!("Build {} had no jobs in flight", self.build_id);
        }

        let mut parts = Vec::new();
        if self.cancelled_count > 0 {
            parts.push(format!("{} cancelled", self.cancelled_count));
        }
        if self.already_terminal_count > 0 {
            parts.push(format!("{} already complete", self.already_terminal_count));
        }
        if self.failed_count > 0 {
            parts.push(format!("{} failed to cancel", self.failed_count));
        }

        format!("Build {}: {} ({})", self.build_id, parts.join(", "), total)
    }
}

/// Cancel `job` at its backend (best effort) and mark it CANCELLED.
///
/// A terminal job is left untouched.
pub fn cancel_job(
    job: &mut Job,
    backend: &dyn ExecutionBackend,
    now: DateTime<Utc>,
) -> JobCancellation {
    if job.is_terminal() {
        return JobCancellation::already_terminal(job);
    }

    let mut error = None;
    let mut acknowledged = false;
    if let Some(ref backend_id) = job.backend_job_id {
        match backend.cancel(backend_id) {
            Ok(()) => acknowledged = true,
            Err(e) => {
                warn!(job_id = %job.id, backend_id = %backend_id, error = %e, "cancel request failed");
                error = Some(e.to_string());
            }
        }
    }

    let reason = match error {
        Some(ref e) => format!("run cancelled; backend cancel failed: {}", e),
        None => "run cancelled".to_string(),
    };
    job.terminate(JobState::Cancelled, now, reason);
    info!(job_id = %job.id, test = %job.test_name, "cancelled");

    JobCancellation {
        job_id: job.id,
        test_name: job.test_name.clone(),
        backend_job_id: job.backend_job_id.clone(),
        backend_acknowledged: acknowledged,
        already_terminal: false,
        error,
    }
}
