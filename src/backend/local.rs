//! Local shell backend

use std::fs::File;
use std::process::{Command, Stdio};

use hpcrun_dialect::{BackendStatus, SchedulerState, StatusQuery};

use super::{BackendError, ExecutionBackend, RunningProcess, Submission};
use crate::job::{BackendJobId, Job};

/// Runs the test script under a shell on this machine
#[derive(Debug, Clone)]
pub struct LocalBackend {
    shell: String,
}

impl LocalBackend {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }
}

impl ExecutionBackend for LocalBackend {
    fn submit(&self, job: &Job) -> Result<Submission, BackendError> {
        let stdout = File::create(&job.output_path)?;
        let stderr = File::create(&job.error_path)?;

        let child = Command::new(&self.shell)
            .arg(job.script_path())
            .current_dir(&job.test_root_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.shell.clone(),
                source,
            })?;

        let pid = child.id();
        Ok(Submission {
            backend_job_id: BackendJobId::Pid(pid),
            process: Some(RunningProcess::new(child, self.shell.clone())),
        })
    }

    fn query_status(&self, id: &BackendJobId) -> Result<StatusQuery, BackendError> {
        let BackendJobId::Pid(pid) = id else {
            return Err(BackendError::ForeignId {
                id: id.clone(),
                backend: "local".to_string(),
            });
        };
        Ok(if process_alive(*pid) {
            StatusQuery::Found(BackendStatus {
                state: SchedulerState::Running,
                raw: "alive".to_string(),
                exit_code: None,
            })
        } else {
            StatusQuery::Absent
        })
    }

    fn cancel(&self, id: &BackendJobId) -> Result<(), BackendError> {
        let BackendJobId::Pid(pid) = id else {
            return Err(BackendError::ForeignId {
                id: id.clone(),
                backend: "local".to_string(),
            });
        };
        terminate_pid(*pid)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate_pid(pid: u32) -> Result<(), BackendError> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(BackendError::Io(std::io::Error::from(errno))),
    }
}

#[cfg(not(unix))]
fn terminate_pid(_pid: u32) -> Result<(), BackendError> {
    Err(BackendError::Unsupported {
        operation: "cancel",
        backend: "local".to_string(),
    })
}
