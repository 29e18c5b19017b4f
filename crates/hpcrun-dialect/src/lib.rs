//! Batch scheduler dialects for hpcrun.
//!
//! Each supported scheduler (Slurm, LSF, PBS Pro, Torque) is described by a
//! pure vocabulary: how to render submission directives, which command lines
//! submit, query and cancel a job, how to read the job id out of the submit
//! reply, and how the scheduler's documented status literals map onto the
//! small set of lifecycle states hpcrun cares about.
//!
//! Nothing in this crate performs I/O. Callers run the returned
//! [`CommandLine`]s and feed the captured output back in.

mod lsf;
mod pbs;
mod slurm;
mod status;
mod torque;

pub use status::{BackendStatus, SchedulerState, StatusQuery};

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors produced while interpreting scheduler replies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialectError {
    #[error("{dialect}: empty submission reply")]
    EmptySubmitReply { dialect: BatchDialect },

    #[error("{dialect}: cannot parse job id from submission reply: {reply:?}")]
    UnparseableJobId { dialect: BatchDialect, reply: String },
}

/// A command to execute, without a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    /// Program name (resolved through `PATH`)
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// File to connect to the program's stdin, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn stdin_from(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(ref stdin) = self.stdin {
            write!(f, " < {}", stdin.display())?;
        }
        Ok(())
    }
}

/// Resources and placement requested for one batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRequest {
    pub job_name: String,
    pub output_path: PathBuf,
    pub error_path: PathBuf,
    /// Queue (LSF, PBS, Torque) or partition (Slurm)
    pub queue: Option<String>,
    /// Account / project to charge
    pub account: Option<String>,
    /// Quality of service (Slurm only)
    pub qos: Option<String>,
    pub nodes: Option<u32>,
    pub procs: Option<u32>,
    pub time_limit_minutes: Option<u32>,
    /// Extra options copied verbatim into directives
    pub options: Vec<String>,
}

/// The closed set of supported batch schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchDialect {
    Slurm,
    Lsf,
    Pbs,
    Torque,
}

impl fmt::Display for BatchDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchDialect::Slurm => write!(f, "slurm"),
            BatchDialect::Lsf => write!(f, "lsf"),
            BatchDialect::Pbs => write!(f, "pbs"),
            BatchDialect::Torque => write!(f, "torque"),
        }
    }
}

impl BatchDialect {
    /// Directive lines (e.g. `#SBATCH --partition=debug`) for a request.
    pub fn directives(&self, request: &BatchRequest) -> Vec<String> {
        match self {
            BatchDialect::Slurm => slurm::directives(request),
            BatchDialect::Lsf => lsf::directives(request),
            BatchDialect::Pbs => pbs::directives(request),
            BatchDialect::Torque => torque::directives(request),
        }
    }

    /// Command line that submits `script`.
    pub fn submit_command(&self, script: &Path) -> CommandLine {
        match self {
            BatchDialect::Slurm => slurm::submit_command(script),
            BatchDialect::Lsf => lsf::submit_command(script),
            BatchDialect::Pbs | BatchDialect::Torque => pbs::submit_command(script),
        }
    }

    /// Extract the scheduler-assigned job id from the submission reply.
    pub fn parse_submit_reply(&self, stdout: &str) -> Result<String, DialectError> {
        if stdout.trim().is_empty() {
            return Err(DialectError::EmptySubmitReply { dialect: *self });
        }
        let parsed = match self {
            BatchDialect::Slurm => slurm::parse_submit_reply(stdout),
            BatchDialect::Lsf => lsf::parse_submit_reply(stdout),
            BatchDialect::Pbs | BatchDialect::Torque => pbs::parse_submit_reply(stdout),
        };
        parsed.ok_or_else(|| DialectError::UnparseableJobId {
            dialect: *self,
            reply: stdout.trim().to_string(),
        })
    }

    /// Command line that reports the status of `job_id`.
    pub fn status_command(&self, job_id: &str) -> CommandLine {
        match self {
            BatchDialect::Slurm => slurm::status_command(job_id),
            BatchDialect::Lsf => lsf::status_command(job_id),
            BatchDialect::Pbs => pbs::status_command(job_id),
            BatchDialect::Torque => torque::status_command(job_id),
        }
    }

    /// Interpret the output of [`status_command`](Self::status_command).
    pub fn parse_status(&self, exit_code: i32, stdout: &str, stderr: &str) -> StatusQuery {
        match self {
            BatchDialect::Slurm => slurm::parse_status(exit_code, stdout, stderr),
            BatchDialect::Lsf => lsf::parse_status(exit_code, stdout, stderr),
            BatchDialect::Pbs => pbs::parse_status(exit_code, stdout, stderr),
            BatchDialect::Torque => torque::parse_status(exit_code, stdout, stderr),
        }
    }

    /// Command line that cancels `job_id`.
    pub fn cancel_command(&self, job_id: &str) -> CommandLine {
        match self {
            BatchDialect::Slurm => CommandLine::new("scancel").arg(job_id),
            BatchDialect::Lsf => CommandLine::new("bkill").arg(job_id),
            BatchDialect::Pbs | BatchDialect::Torque => CommandLine::new("qdel").arg(job_id),
        }
    }

    /// Map a documented status literal onto a lifecycle state.
    pub fn map_state(&self, literal: &str) -> SchedulerState {
        match self {
            BatchDialect::Slurm => slurm::map_state(literal),
            BatchDialect::Lsf => lsf::map_state(literal),
            BatchDialect::Pbs => pbs::map_state(literal),
            BatchDialect::Torque => torque::map_state(literal),
        }
    }
}

/// Format a minute count as `HH:MM:00`.
pub(crate) fn walltime(minutes: u32) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_display() {
        let cmd = CommandLine::new("bsub").stdin_from(Path::new("/tmp/job.sh"));
        assert_eq!(cmd.to_string(), "bsub < /tmp/job.sh");

        let cmd = CommandLine::new("scancel").arg("42");
        assert_eq!(cmd.to_string(), "scancel 42");
    }

    #[test]
    fn test_empty_submit_reply_is_error() {
        for dialect in [
            BatchDialect::Slurm,
            BatchDialect::Lsf,
            BatchDialect::Pbs,
            BatchDialect::Torque,
        ] {
            assert_eq!(
                dialect.parse_submit_reply("  \n"),
                Err(DialectError::EmptySubmitReply { dialect })
            );
        }
    }

    #[test]
    fn test_cancel_commands() {
        assert_eq!(BatchDialect::Slurm.cancel_command("7").program, "scancel");
        assert_eq!(BatchDialect::Lsf.cancel_command("7").program, "bkill");
        assert_eq!(BatchDialect::Pbs.cancel_command("7").program, "qdel");
        assert_eq!(BatchDialect::Torque.cancel_command("7.host").args, vec!["7.host"]);
    }

    #[test]
    fn test_walltime_format() {
        assert_eq!(walltime(5), "00:05:00");
        assert_eq!(walltime(90), "01:30:00");
    }
}
