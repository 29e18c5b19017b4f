//! Container backend (docker, podman, singularity, apptainer)
//!
//! The test root is bind-mounted at `/hpcrun` and the test script runs there.
//! The runtime's blocking `run`/`exec` provides the exit status.

use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::Arc;

use hpcrun_dialect::{BackendStatus, CommandLine, SchedulerState, StatusQuery};

use super::{BackendError, CommandRunner, ExecutionBackend, RunningProcess, Submission};
use crate::job::{BackendJobId, Job};
use crate::registry::{ContainerRuntime, ExecutorConfig};

/// Mount point of the test root inside the container
pub const CONTAINER_TEST_ROOT: &str = "/hpcrun";

#[derive(Clone)]
pub struct ContainerBackend {
    runtime: ContainerRuntime,
    image: String,
    shell: String,
    mounts: Vec<String>,
    options: Vec<String>,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for ContainerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerBackend")
            .field("runtime", &self.runtime)
            .field("image", &self.image)
            .finish()
    }
}

impl ContainerBackend {
    pub fn from_executor(executor: &ExecutorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runtime: executor.runtime.unwrap_or(ContainerRuntime::Docker),
            image: executor.image.clone().unwrap_or_default(),
            shell: executor.shell.clone(),
            mounts: executor.mounts.clone(),
            options: executor.options.clone(),
            runner,
        }
    }

    /// Container name for a job
    pub fn container_name(job: &Job) -> String {
        format!("hpcrun-{}", job.id)
    }

    /// Command line that runs the job's script inside the container
    pub fn command_line(&self, job: &Job) -> CommandLine {
        let root = format!("{}:{}", job.test_root_path.display(), CONTAINER_TEST_ROOT);
        let script = format!("{}/{}.sh", CONTAINER_TEST_ROOT, job.test_name);
        let program = self.runtime.program();

        let mut cmd = if self.runtime.supports_names() {
            let mut cmd = CommandLine::new(program)
                .arg("run")
                .arg("--rm")
                .arg("--name")
                .arg(Self::container_name(job))
                .arg("-v")
                .arg(root);
            for mount in &self.mounts {
                cmd = cmd.arg("-v").arg(mount.clone());
            }
            cmd.arg("-w").arg(CONTAINER_TEST_ROOT)
        } else {
            let mut cmd = CommandLine::new(program).arg("exec").arg("-B").arg(root);
            for mount in &self.mounts {
                cmd = cmd.arg("-B").arg(mount.clone());
            }
            cmd.arg("--pwd").arg(CONTAINER_TEST_ROOT)
        };

        for option in &self.options {
            cmd = cmd.arg(option.clone());
        }
        cmd.arg(self.image.clone()).arg(self.shell.clone()).arg(script)
    }

    fn container_id<'a>(&self, id: &'a BackendJobId) -> Result<&'a str, BackendError> {
        match id {
            BackendJobId::Container(name) => Ok(name),
            other => Err(BackendError::ForeignId {
                id: other.clone(),
                backend: self.runtime.program().to_string(),
            }),
        }
    }
}

impl ExecutionBackend for ContainerBackend {
    fn submit(&self, job: &Job) -> Result<Submission, BackendError> {
        let cmd = self.command_line(job);
        let stdout = File::create(&job.output_path)?;
        let stderr = File::create(&job.error_path)?;

        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: cmd.program.clone(),
                source,
            })?;

        Ok(Submission {
            backend_job_id: BackendJobId::Container(Self::container_name(job)),
            process: Some(RunningProcess::new(child, cmd.program)),
        })
    }

    fn query_status(&self, id: &BackendJobId) -> Result<StatusQuery, BackendError> {
        let name = self.container_id(id)?;
        if !self.runtime.supports_names() {
            return Err(BackendError::Unsupported {
                operation: "query_status",
                backend: self.runtime.program().to_string(),
            });
        }

        let cmd = CommandLine::new(self.runtime.program())
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Status}}")
            .arg(name);
        let output = match self.runner.run(&cmd) {
            Ok(output) => output,
            Err(e) => return Ok(StatusQuery::Error(e.to_string())),
        };
        if !output.success() {
            // `--rm` removes the container as soon as it exits
            if output.stderr.contains("No such") || output.stderr.contains("no such") {
                return Ok(StatusQuery::Absent);
            }
            return Ok(StatusQuery::Error(output.combined()));
        }

        let raw = output.stdout.trim().to_string();
        let state = match raw.as_str() {
            "created" => SchedulerState::Pending,
            "running" | "paused" | "restarting" | "removing" => SchedulerState::Running,
            "exited" | "dead" => SchedulerState::Completed,
            _ => SchedulerState::Unrecognized,
        };
        Ok(StatusQuery::Found(BackendStatus {
            state,
            raw,
            exit_code: None,
        }))
    }

    fn cancel(&self, id: &BackendJobId) -> Result<(), BackendError> {
        let name = self.container_id(id)?;
        if !self.runtime.supports_names() {
            return Err(BackendError::Unsupported {
                operation: "cancel",
                backend: self.runtime.program().to_string(),
            });
        }

        let cmd = CommandLine::new(self.runtime.program()).arg("kill").arg(name);
        let output = self.runner.run(&cmd).map_err(|source| BackendError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;
        if output.success() {
            Ok(())
        } else {
            Err(BackendError::Rejected {
                command: cmd.to_string(),
                exit_code: output.exit_code,
                output: output.combined(),
            })
        }
    }
}
