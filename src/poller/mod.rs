//! Job polling and the state-transition rule
//!
//! [`Poller::advance`] moves one asynchronous job forward from a single
//! status query. It is idempotent: calling it on a terminal job does nothing,
//! and every transition it makes is monotonic. [`Poller::complete_sync`] is
//! the synchronous counterpart for jobs whose backend hands back a process.
//!
//! The [`PollScheduler`] drives `advance` for every in-flight batch job from
//! one thread.

mod scheduler;

pub use scheduler::{PollScheduler, SchedulerError};

use std::fs;

use chrono::{DateTime, Utc};
use hpcrun_dialect::{BackendStatus, SchedulerState, StatusQuery};
use tracing::{debug, info, warn};

use crate::backend::{ExecutionBackend, ProcessExit};
use crate::config::DEFAULT_MAX_POLL_ERRORS;
use crate::evaluate::UNKNOWN_RETURNCODE;
use crate::job::{Job, JobState};
use crate::registry::ExecutorConfig;
use crate::timeout::{BudgetStatus, PendingBudget};

/// Applies backend observations to jobs
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    max_poll_errors: u32,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POLL_ERRORS)
    }
}

impl Poller {
    /// Poller tolerating up to `max_poll_errors` consecutive failed queries
    pub fn new(max_poll_errors: u32) -> Self {
        Self { max_poll_errors }
    }

    pub fn max_poll_errors(&self) -> u32 {
        self.max_poll_errors
    }

    /// Query the backend once and apply the result to `job`.
    pub fn advance(&self, job: &mut Job, executor: &ExecutorConfig, backend: &dyn ExecutionBackend) {
        self.advance_at(job, executor, backend, Utc::now())
    }

    /// [`advance`](Self::advance) with an explicit clock
    pub fn advance_at(
        &self,
        job: &mut Job,
        executor: &ExecutorConfig,
        backend: &dyn ExecutionBackend,
        now: DateTime<Utc>,
    ) {
        if job.is_terminal() {
            return;
        }
        let Some(backend_id) = job.backend_job_id.clone() else {
            return;
        };

        match backend.query_status(&backend_id) {
            Ok(StatusQuery::Found(status)) => {
                job.poll_errors = 0;
                job.observed = true;
                self.apply_status(job, status, now);
            }
            Ok(StatusQuery::Absent) => {
                job.poll_errors = 0;
                if job.observed {
                    job.diagnose(format!(
                        "backend no longer reports job {} (last status {}); treating it as finished",
                        backend_id,
                        job.last_backend_status.as_deref().unwrap_or("unknown")
                    ));
                    self.finish(job, None, now);
                } else {
                    debug!(job_id = %job.id, backend_id = %backend_id, "not yet visible to backend");
                }
            }
            Ok(StatusQuery::Error(message)) => self.record_poll_error(job, &message, now),
            Err(e) => self.record_poll_error(job, &e.to_string(), now),
        }

        if job.is_terminal() {
            return;
        }

        let Some(submitted) = job.submit_time else {
            return;
        };
        let budget = PendingBudget::new(submitted, executor.max_pending_seconds);
        if let BudgetStatus::Exceeded {
            elapsed_seconds,
            budget_seconds,
        } = budget.check(now)
        {
            job.terminate(
                JobState::Timeout,
                now,
                format!(
                    "not finished after {}s (budget {}s); last backend status: {}",
                    elapsed_seconds,
                    budget_seconds,
                    job.last_backend_status.as_deref().unwrap_or("none")
                ),
            );
            info!(job_id = %job.id, backend_id = %backend_id, elapsed_seconds, "timed out");
            match backend.cancel(&backend_id) {
                Ok(()) => job.diagnose(format!("cancellation requested for {}", backend_id)),
                Err(e) => {
                    warn!(job_id = %job.id, backend_id = %backend_id, error = %e, "cancellation failed");
                    job.diagnose(format!("cancellation of {} failed: {}", backend_id, e));
                }
            }
        }
    }

    fn apply_status(&self, job: &mut Job, status: BackendStatus, now: DateTime<Utc>) {
        let previous = job.last_backend_status.replace(status.raw.clone());
        match status.state {
            SchedulerState::Pending => {
                job.apply_report(JobState::Pending);
            }
            SchedulerState::Running => {
                if job.apply_report(JobState::Running) && job.start_time.is_none() {
                    job.start_time = Some(now);
                }
            }
            SchedulerState::Completed | SchedulerState::Failed => {
                self.finish(job, status.exit_code, now);
            }
            SchedulerState::Cancelled => {
                job.terminate(
                    JobState::Cancelled,
                    now,
                    format!("backend reported the job cancelled ({})", status.raw),
                );
            }
            SchedulerState::Unrecognized => {
                if previous.as_deref() != Some(status.raw.as_str()) {
                    job.diagnose(format!(
                        "unrecognized backend status '{}'; job stays {}",
                        status.raw, job.state
                    ));
                }
            }
        }
    }

    /// Complete a backend-terminal job, resolving its exit status
    fn finish(&self, job: &mut Job, exit_code: Option<i32>, now: DateTime<Utc>) {
        let mut returncode = match exit_code.or_else(|| read_returncode_file(job)) {
            Some(code) => code,
            None => {
                job.diagnose("no exit status available from backend or launcher");
                UNKNOWN_RETURNCODE
            }
        };

        if !job.output_path.exists() && !job.error_path.exists() {
            job.diagnose(format!(
                "no output files found under {}",
                job.test_root_path.display()
            ));
            returncode = UNKNOWN_RETURNCODE;
        }

        if let Err(e) = job.complete(returncode, now) {
            job.diagnose(format!("could not complete job: {}", e));
        }
    }

    fn record_poll_error(&self, job: &mut Job, message: &str, now: DateTime<Utc>) {
        job.poll_errors += 1;
        warn!(
            job_id = %job.id,
            attempt = job.poll_errors,
            error = %message,
            "status query failed"
        );
        if job.poll_errors > self.max_poll_errors {
            job.terminate(
                JobState::PollError,
                now,
                format!(
                    "status query failed {} times in a row: {}",
                    job.poll_errors,
                    message.trim()
                ),
            );
        }
    }

    /// Finish a synchronous job from its process exit.
    pub fn complete_sync(&self, job: &mut Job, exit: ProcessExit) {
        let now = Utc::now();
        if job.is_terminal() {
            return;
        }
        if exit.cancelled {
            job.returncode = Some(exit.returncode());
            job.terminate(
                JobState::Cancelled,
                now,
                format!("run cancelled; process exited with {}", exit.returncode()),
            );
            return;
        }
        if let Err(e) = job.complete(exit.returncode(), now) {
            job.diagnose(format!("could not complete job: {}", e));
        }
    }
}

/// Exit status the batch launcher wrote next to the test script
fn read_returncode_file(job: &Job) -> Option<i32> {
    fs::read_to_string(job.returncode_path())
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::job::{BackendJobId, TestSpec};
    use crate::registry::ExecutorCategory;
    use chrono::Duration;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Backend answering status queries from a queue
    struct Scripted {
        replies: RefCell<VecDeque<Result<StatusQuery, BackendError>>>,
        cancels: Cell<usize>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<StatusQuery, BackendError>>) -> Self {
            Self {
                replies: RefCell::new(replies.into()),
                cancels: Cell::new(0),
            }
        }
    }

    impl ExecutionBackend for Scripted {
        fn submit(&self, _job: &Job) -> Result<crate::backend::Submission, BackendError> {
            unreachable!()
        }

        fn query_status(&self, _id: &BackendJobId) -> Result<StatusQuery, BackendError> {
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or(Ok(StatusQuery::Absent))
        }

        fn cancel(&self, _id: &BackendJobId) -> Result<(), BackendError> {
            self.cancels.set(self.cancels.get() + 1);
            Ok(())
        }
    }

    fn found(state: SchedulerState, raw: &str, exit_code: Option<i32>) -> Result<StatusQuery, BackendError> {
        Ok(StatusQuery::Found(BackendStatus {
            state,
            raw: raw.to_string(),
            exit_code,
        }))
    }

    fn executor(max_pending_seconds: u64) -> ExecutorConfig {
        ExecutorConfig {
            category: ExecutorCategory::Slurm,
            name: "debug".to_string(),
            description: None,
            shell: "bash".to_string(),
            queue: None,
            account: None,
            qos: None,
            options: Vec::new(),
            poll_interval_seconds: 1,
            max_pending_seconds,
            runtime: None,
            image: None,
            mounts: Vec::new(),
        }
    }

    fn submitted(temp: &TempDir) -> Job {
        let mut job = Job::new(&TestSpec::new("t", "slurm/debug", "true"), 0, temp.path());
        std::fs::create_dir_all(&job.test_root_path).unwrap();
        job.transition(JobState::Submitted).unwrap();
        job.backend_job_id = Some(BackendJobId::Scheduler("1001".to_string()));
        job.submit_time = Some(Utc::now());
        job
    }

    #[test]
    fn test_pending_then_running_then_completed() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        std::fs::write(&job.output_path, "ok\n").unwrap();
        let backend = Scripted::new(vec![
            found(SchedulerState::Pending, "PENDING", None),
            found(SchedulerState::Running, "RUNNING", None),
            found(SchedulerState::Completed, "COMPLETED", Some(0)),
        ]);
        let poller = Poller::default();
        let exec = executor(3600);

        poller.advance(&mut job, &exec, &backend);
        assert_eq!(job.state, JobState::Pending);
        poller.advance(&mut job, &exec, &backend);
        assert_eq!(job.state, JobState::Running);
        assert!(job.start_time.is_some());
        poller.advance(&mut job, &exec, &backend);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.returncode, Some(0));
        assert_eq!(job.last_backend_status.as_deref(), Some("COMPLETED"));
    }

    #[test]
    fn test_advance_on_terminal_is_noop() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        job.terminate(JobState::Cancelled, Utc::now(), "stop");
        let before = job.clone();
        let backend = Scripted::new(vec![found(SchedulerState::Running, "RUNNING", None)]);

        Poller::default().advance(&mut job, &executor(3600), &backend);
        assert_eq!(job, before);
        assert_eq!(backend.replies.borrow().len(), 1);
    }

    #[test]
    fn test_backward_report_ignored() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        let backend = Scripted::new(vec![
            found(SchedulerState::Running, "RUNNING", None),
            found(SchedulerState::Pending, "REQUEUED", None),
        ]);
        let poller = Poller::default();
        poller.advance(&mut job, &executor(3600), &backend);
        poller.advance(&mut job, &executor(3600), &backend);
        assert_eq!(job.state, JobState::Running);
        assert!(job.diagnostics.iter().any(|d| d.contains("ignored backend report")));
    }

    #[test]
    fn test_absent_after_observed_completes() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        std::fs::write(&job.output_path, "").unwrap();
        std::fs::write(job.returncode_path(), "3\n").unwrap();
        let backend = Scripted::new(vec![
            found(SchedulerState::Running, "R", None),
            Ok(StatusQuery::Absent),
        ]);
        let poller = Poller::default();
        poller.advance(&mut job, &executor(3600), &backend);
        poller.advance(&mut job, &executor(3600), &backend);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.returncode, Some(3));
    }

    #[test]
    fn test_absent_never_observed_keeps_polling() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        let backend = Scripted::new(vec![Ok(StatusQuery::Absent), Ok(StatusQuery::Absent)]);
        let poller = Poller::default();
        poller.advance(&mut job, &executor(3600), &backend);
        poller.advance(&mut job, &executor(3600), &backend);
        assert_eq!(job.state, JobState::Submitted);
        assert!(!job.observed);
    }

    #[test]
    fn test_terminal_without_outputs_is_unknown_returncode() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        let backend = Scripted::new(vec![found(SchedulerState::Completed, "DONE", Some(0))]);
        Poller::default().advance(&mut job, &executor(3600), &backend);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.returncode, Some(UNKNOWN_RETURNCODE));
        assert!(job.diagnostics.iter().any(|d| d.contains("no output files")));
    }

    #[test]
    fn test_poll_errors_bounded() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        let backend = Scripted::new(
            (0..4)
                .map(|_| Ok(StatusQuery::Error("sacct: connection refused".to_string())))
                .collect(),
        );
        let poller = Poller::new(3);
        for _ in 0..3 {
            poller.advance(&mut job, &executor(3600), &backend);
            assert!(!job.is_terminal());
        }
        poller.advance(&mut job, &executor(3600), &backend);
        assert_eq!(job.state, JobState::PollError);
        assert!(job.diagnostics.last().unwrap().contains("connection refused"));
    }

    #[test]
    fn test_poll_error_count_resets_on_success() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        let backend = Scripted::new(vec![
            Ok(StatusQuery::Error("timeout".to_string())),
            Ok(StatusQuery::Error("timeout".to_string())),
            found(SchedulerState::Pending, "PEND", None),
            Ok(StatusQuery::Error("timeout".to_string())),
            Ok(StatusQuery::Error("timeout".to_string())),
        ]);
        let poller = Poller::new(2);
        for _ in 0..5 {
            poller.advance(&mut job, &executor(3600), &backend);
        }
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.poll_errors, 2);
    }

    #[test]
    fn test_budget_exceeded_times_out_and_cancels_once() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        let submitted_at = job.submit_time.unwrap();
        let backend = Scripted::new(vec![
            found(SchedulerState::Pending, "PENDING", None),
            found(SchedulerState::Pending, "PENDING", None),
        ]);
        let poller = Poller::default();
        let exec = executor(60);

        poller.advance_at(&mut job, &exec, &backend, submitted_at + Duration::seconds(30));
        assert_eq!(job.state, JobState::Pending);

        poller.advance_at(&mut job, &exec, &backend, submitted_at + Duration::seconds(61));
        assert_eq!(job.state, JobState::Timeout);
        assert_eq!(backend.cancels.get(), 1);
        assert!(job.diagnostics.iter().any(|d| d.contains("budget 60s")));

        poller.advance_at(&mut job, &exec, &backend, submitted_at + Duration::seconds(90));
        assert_eq!(backend.cancels.get(), 1);
    }

    #[test]
    fn test_unrecognized_status_is_not_guessed() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        let backend = Scripted::new(vec![
            found(SchedulerState::Unrecognized, "M", None),
            found(SchedulerState::Unrecognized, "M", None),
        ]);
        let poller = Poller::default();
        poller.advance(&mut job, &executor(3600), &backend);
        poller.advance(&mut job, &executor(3600), &backend);
        assert_eq!(job.state, JobState::Submitted);
        assert_eq!(job.last_backend_status.as_deref(), Some("M"));
        assert_eq!(
            job.diagnostics
                .iter()
                .filter(|d| d.contains("unrecognized"))
                .count(),
            1
        );
    }

    #[test]
    fn test_backend_cancelled() {
        let temp = TempDir::new().unwrap();
        let mut job = submitted(&temp);
        let backend = Scripted::new(vec![found(SchedulerState::Cancelled, "CANCELLED", None)]);
        Poller::default().advance(&mut job, &executor(3600), &backend);
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.end_time.is_some());
    }

    #[test]
    fn test_complete_sync() {
        let temp = TempDir::new().unwrap();
        let poller = Poller::default();

        let mut job = submitted(&temp);
        job.transition(JobState::Running).unwrap();
        poller.complete_sync(
            &mut job,
            ProcessExit {
                code: Some(1),
                signal: None,
                cancelled: false,
            },
        );
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.returncode, Some(1));

        let mut job = submitted(&temp);
        poller.complete_sync(
            &mut job,
            ProcessExit {
                code: None,
                signal: Some(15),
                cancelled: true,
            },
        );
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.returncode, Some(143));
    }

    #[test]
    fn test_complete_sync_leaves_terminal_job_alone() {
        let temp = TempDir::new().unwrap();
        let poller = Poller::default();

        let mut job = submitted(&temp);
        job.terminate(JobState::Cancelled, Utc::now(), "run cancelled before wait");
        let before = job.clone();
        poller.complete_sync(
            &mut job,
            ProcessExit {
                code: None,
                signal: Some(9),
                cancelled: true,
            },
        );
        assert_eq!(job, before);
        assert_eq!(job.returncode, None);
    }
}
