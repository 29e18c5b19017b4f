//! Execution backends
//!
//! Every backend offers the same three capabilities: submit a prepared job,
//! query its status by backend id, and cancel it. The set of backends is
//! closed; a new backend is a new [`Backend`] variant.
//!
//! Local and container jobs are synchronous: `submit` returns the live
//! [`RunningProcess`] and the caller blocks on it. Batch jobs are
//! asynchronous: `submit` returns only the scheduler id and the poller
//! follows the job with `query_status`.

mod batch;
mod command;
mod container;
mod local;
mod process;

pub use batch::BatchBackend;
pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use container::{ContainerBackend, CONTAINER_TEST_ROOT};
pub use local::LocalBackend;
pub use process::{ProcessExit, RunningProcess};

use std::io;
use std::sync::Arc;

use hpcrun_dialect::{DialectError, StatusQuery};

use crate::job::{BackendJobId, Job};
use crate::registry::{ExecutorCategory, ExecutorConfig};

/// Errors from backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {exit_code}: {output}")]
    Rejected {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error(transparent)]
    Dialect(#[from] DialectError),

    #[error("{operation} is not supported by {backend}")]
    Unsupported {
        operation: &'static str,
        backend: String,
    },

    #[error("backend id {id} does not belong to {backend}")]
    ForeignId { id: BackendJobId, backend: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// What a successful submission hands back
#[derive(Debug)]
pub struct Submission {
    pub backend_job_id: BackendJobId,
    /// Live process for synchronous backends
    pub process: Option<RunningProcess>,
}

/// The capability interface shared by all backends
pub trait ExecutionBackend {
    /// Hand a prepared job (scripts already written) to the backend
    fn submit(&self, job: &Job) -> Result<Submission, BackendError>;

    /// Ask the backend about a job
    fn query_status(&self, id: &BackendJobId) -> Result<StatusQuery, BackendError>;

    /// Ask the backend to stop a job
    fn cancel(&self, id: &BackendJobId) -> Result<(), BackendError>;
}

/// The closed set of backends
#[derive(Debug, Clone)]
pub enum Backend {
    Local(LocalBackend),
    Batch(BatchBackend),
    Container(ContainerBackend),
}

impl Backend {
    /// Backend for an executor. Batch and container backends run their
    /// auxiliary commands through `runner`.
    pub fn for_executor(executor: &ExecutorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        match executor.category {
            ExecutorCategory::Local => Backend::Local(LocalBackend::new(executor.shell.clone())),
            ExecutorCategory::Container => {
                Backend::Container(ContainerBackend::from_executor(executor, runner))
            }
            category => match category.dialect() {
                Some(dialect) => Backend::Batch(BatchBackend::new(dialect, runner)),
                None => Backend::Local(LocalBackend::new(executor.shell.clone())),
            },
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Backend::Batch(_))
    }

    fn inner(&self) -> &dyn ExecutionBackend {
        match self {
            Backend::Local(b) => b,
            Backend::Batch(b) => b,
            Backend::Container(b) => b,
        }
    }
}

impl ExecutionBackend for Backend {
    fn submit(&self, job: &Job) -> Result<Submission, BackendError> {
        self.inner().submit(job)
    }

    fn query_status(&self, id: &BackendJobId) -> Result<StatusQuery, BackendError> {
        self.inner().query_status(id)
    }

    fn cancel(&self, id: &BackendJobId) -> Result<(), BackendError> {
        self.inner().cancel(id)
    }
}
