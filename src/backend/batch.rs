//! Batch scheduler backend (Slurm, LSF, PBS Pro, Torque)

use std::sync::Arc;

use hpcrun_dialect::{BatchDialect, StatusQuery};
use tracing::debug;

use super::{BackendError, CommandRunner, ExecutionBackend, Submission};
use crate::job::{BackendJobId, Job};

/// Submits the job launcher to a batch scheduler and polls it by job id
#[derive(Clone)]
pub struct BatchBackend {
    dialect: BatchDialect,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for BatchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchBackend")
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl BatchBackend {
    pub fn new(dialect: BatchDialect, runner: Arc<dyn CommandRunner>) -> Self {
        Self { dialect, runner }
    }

    pub fn dialect(&self) -> BatchDialect {
        self.dialect
    }

    fn scheduler_id<'a>(&self, id: &'a BackendJobId) -> Result<&'a str, BackendError> {
        match id {
            BackendJobId::Scheduler(job_id) => Ok(job_id),
            other => Err(BackendError::ForeignId {
                id: other.clone(),
                backend: self.dialect.to_string(),
            }),
        }
    }
}

impl ExecutionBackend for BatchBackend {
    fn submit(&self, job: &Job) -> Result<Submission, BackendError> {
        let command = self.dialect.submit_command(&job.launcher_path());
        debug!(job_id = %job.id, command = %command, "submitting");

        let output = self.runner.run(&command).map_err(|source| BackendError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        if !output.success() {
            return Err(BackendError::Rejected {
                command: command.to_string(),
                exit_code: output.exit_code,
                output: output.combined(),
            });
        }

        let scheduler_id = self.dialect.parse_submit_reply(&output.stdout)?;
        Ok(Submission {
            backend_job_id: BackendJobId::Scheduler(scheduler_id),
            process: None,
        })
    }

    fn query_status(&self, id: &BackendJobId) -> Result<StatusQuery, BackendError> {
        let job_id = self.scheduler_id(id)?;
        let command = self.dialect.status_command(job_id);
        Ok(match self.runner.run(&command) {
            Ok(output) => self
                .dialect
                .parse_status(output.exit_code, &output.stdout, &output.stderr),
            Err(e) => StatusQuery::Error(format!("{}: {}", command.program, e)),
        })
    }

    fn cancel(&self, id: &BackendJobId) -> Result<(), BackendError> {
        let job_id = self.scheduler_id(id)?;
        let command = self.dialect.cancel_command(job_id);
        let output = self.runner.run(&command).map_err(|source| BackendError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        if output.success() {
            Ok(())
        } else {
            Err(BackendError::Rejected {
                command: command.to_string(),
                exit_code: output.exit_code,
                output: output.combined(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Reply, ScriptedScheduler};
    use crate::job::TestSpec;
    use hpcrun_dialect::SchedulerState;
    use std::path::Path;

    fn job() -> Job {
        Job::new(&TestSpec::new("t", "slurm/debug", "true"), 0, Path::new("/r"))
    }

    #[test]
    fn test_submit_parses_id() {
        let scheduler = Arc::new(ScriptedScheduler::new(BatchDialect::Slurm));
        let backend = BatchBackend::new(BatchDialect::Slurm, scheduler.clone());

        let submission = backend.submit(&job()).unwrap();
        assert_eq!(
            submission.backend_job_id,
            BackendJobId::Scheduler("1001".to_string())
        );
        assert!(submission.process.is_none());
        assert_eq!(scheduler.count("sbatch"), 1);
    }

    #[test]
    fn test_submit_rejection_keeps_raw_output() {
        let scheduler = Arc::new(
            ScriptedScheduler::new(BatchDialect::Slurm)
                .with_submit_reply(Reply::fail(1, "sbatch: error: invalid partition specified: nope")),
        );
        let backend = BatchBackend::new(BatchDialect::Slurm, scheduler);

        let err = backend.submit(&job()).unwrap_err();
        assert!(err.to_string().contains("invalid partition"));
    }

    #[test]
    fn test_submit_unparseable_reply() {
        let scheduler = Arc::new(
            ScriptedScheduler::new(BatchDialect::Lsf).with_submit_reply(Reply::ok("Request aborted by esub.\n")),
        );
        let backend = BatchBackend::new(BatchDialect::Lsf, scheduler);
        assert!(matches!(
            backend.submit(&job()),
            Err(BackendError::Dialect(_))
        ));
    }

    #[test]
    fn test_query_status_maps_literal() {
        let scheduler = Arc::new(
            ScriptedScheduler::new(BatchDialect::Pbs)
                .with_status_replies(vec![Reply::state(BatchDialect::Pbs, "R", None)]),
        );
        let backend = BatchBackend::new(BatchDialect::Pbs, scheduler);
        match backend
            .query_status(&BackendJobId::Scheduler("1001".to_string()))
            .unwrap()
        {
            StatusQuery::Found(status) => assert_eq!(status.state, SchedulerState::Running),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cancel_invokes_dialect_command() {
        let scheduler = Arc::new(ScriptedScheduler::new(BatchDialect::Torque));
        let backend = BatchBackend::new(BatchDialect::Torque, scheduler.clone());
        backend
            .cancel(&BackendJobId::Scheduler("12.torque".to_string()))
            .unwrap();
        assert_eq!(scheduler.count("qdel"), 1);
    }
}
