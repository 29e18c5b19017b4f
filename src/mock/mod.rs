//! Scripted batch scheduler
//!
//! A [`CommandRunner`] that impersonates the Slurm, LSF, PBS Pro and Torque
//! command-line tools. Submissions get sequential job ids, status queries
//! replay a scripted sequence of replies (the last reply repeats), and every
//! invocation is recorded so tests can assert on what was run.
//!
//! With [`ScriptedScheduler::executing_launchers`] each launcher really runs
//! at submission, and once the scripted replies are used up the job reports
//! finished with the launcher's own exit status.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use hpcrun::mock::{Reply, ScriptedScheduler};
//! use hpcrun_dialect::BatchDialect;
//!
//! let scheduler = Arc::new(
//!     ScriptedScheduler::new(BatchDialect::Slurm).with_status_replies(vec![
//!         Reply::state(BatchDialect::Slurm, "PENDING", None),
//!         Reply::state(BatchDialect::Slurm, "COMPLETED", Some(0)),
//!     ]),
//! );
//! assert_eq!(scheduler.cancel_count(), 0);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use hpcrun_dialect::{BatchDialect, CommandLine};

use crate::backend::{CommandOutput, CommandRunner};

/// First job id handed out
const FIRST_JOB_ID: u64 = 1001;

/// One canned reply of a scheduler command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Reply {
    /// Exit 0 with the given stdout
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// Non-zero exit with the given stderr
    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Status reply reporting `literal`, formatted the way the dialect's
    /// status command prints it
    pub fn state(dialect: BatchDialect, literal: &str, exit_code: Option<i32>) -> Self {
        let stdout = match dialect {
            BatchDialect::Slurm => format!("{}|{}:0\n", literal, exit_code.unwrap_or(0)),
            BatchDialect::Lsf => match exit_code {
                Some(code) if code != 0 => format!("{}|{}\n", literal, code),
                _ => format!("{}|-\n", literal),
            },
            BatchDialect::Pbs | BatchDialect::Torque => {
                let exit_key = if dialect == BatchDialect::Pbs {
                    "Exit_status"
                } else {
                    "exit_status"
                };
                let mut listing = format!("Job Id: {}\n    job_state = {}\n", FIRST_JOB_ID, literal);
                if let Some(code) = exit_code {
                    listing.push_str(&format!("    {} = {}\n", exit_key, code));
                }
                listing
            }
        };
        Self::ok(&stdout)
    }

    /// Status reply of a finished job, using the literal the dialect prints
    /// for a clean or failed exit
    pub fn finished(dialect: BatchDialect, exit_code: i32) -> Self {
        let literal = match dialect {
            BatchDialect::Slurm if exit_code == 0 => "COMPLETED",
            BatchDialect::Slurm => "FAILED",
            BatchDialect::Lsf if exit_code == 0 => "DONE",
            BatchDialect::Lsf => "EXIT",
            BatchDialect::Pbs => "F",
            BatchDialect::Torque => "C",
        };
        Self::state(dialect, literal, Some(exit_code))
    }

    /// Reply of a scheduler that has no record of the job
    pub fn absent(dialect: BatchDialect) -> Self {
        match dialect {
            BatchDialect::Slurm => Self::ok(""),
            BatchDialect::Lsf => Self::fail(255, "Job <0> is not found\n"),
            BatchDialect::Pbs | BatchDialect::Torque => {
                Self::fail(153, "qstat: Unknown Job Id 0\n")
            }
        }
    }

    fn into_output(self) -> CommandOutput {
        CommandOutput {
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

#[derive(Debug)]
struct ScriptState {
    next_id: u64,
    submit_reply: Option<Reply>,
    status_replies: VecDeque<Reply>,
    last_status: Option<Reply>,
    cancel_reply: Option<Reply>,
    launcher_exits: BTreeMap<String, i32>,
    invocations: Vec<CommandLine>,
}

/// Simulated batch scheduler CLI
#[derive(Debug)]
pub struct ScriptedScheduler {
    dialect: BatchDialect,
    execute_launchers: bool,
    state: Mutex<ScriptState>,
}

impl ScriptedScheduler {
    pub fn new(dialect: BatchDialect) -> Self {
        Self {
            dialect,
            execute_launchers: false,
            state: Mutex::new(ScriptState {
                next_id: FIRST_JOB_ID,
                submit_reply: None,
                status_replies: VecDeque::new(),
                last_status: None,
                cancel_reply: None,
                launcher_exits: BTreeMap::new(),
                invocations: Vec::new(),
            }),
        }
    }

    /// Reply to every submission with `reply` instead of a fresh job id
    pub fn with_submit_reply(self, reply: Reply) -> Self {
        self.lock().submit_reply = Some(reply);
        self
    }

    /// Status replies in order; the last one repeats
    pub fn with_status_replies(self, replies: Vec<Reply>) -> Self {
        self.lock().status_replies = replies.into();
        self
    }

    pub fn with_cancel_reply(self, reply: Reply) -> Self {
        self.lock().cancel_reply = Some(reply);
        self
    }

    /// Run each submitted launcher with `sh` at submission time, writing
    /// `<name>.out` and `<name>.err` next to it as the scheduler would.
    /// After the scripted status replies, the job reports finished with the
    /// launcher's exit status.
    pub fn executing_launchers(mut self) -> Self {
        self.execute_launchers = true;
        self
    }

    pub fn dialect(&self) -> BatchDialect {
        self.dialect
    }

    /// Every command run so far
    pub fn invocations(&self) -> Vec<CommandLine> {
        self.lock().invocations.clone()
    }

    /// Number of invocations of `program`
    pub fn count(&self, program: &str) -> usize {
        self.lock()
            .invocations
            .iter()
            .filter(|c| c.program == program)
            .count()
    }

    pub fn submit_count(&self) -> usize {
        self.count(&self.dialect.submit_command(Path::new("x")).program)
    }

    pub fn status_count(&self) -> usize {
        self.count(&self.dialect.status_command("0").program)
    }

    pub fn cancel_count(&self) -> usize {
        self.count(&self.dialect.cancel_command("0").program)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        // A panicking test thread must not hide the recorded invocations
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submit(&self, command: &CommandLine) -> io::Result<CommandOutput> {
        let reply = {
            let mut state = self.lock();
            match state.submit_reply.clone() {
                Some(reply) => reply,
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    Reply::ok(&self.submit_reply_for(id))
                }
            }
        };

        if self.execute_launchers && reply.exit_code == 0 {
            let launcher = command
                .stdin
                .clone()
                .or_else(|| command.args.last().map(PathBuf::from));
            if let Some(launcher) = launcher {
                let exit_code = run_launcher(&launcher)?;
                if let Ok(job_id) = self.dialect.parse_submit_reply(&reply.stdout) {
                    self.lock().launcher_exits.insert(job_id, exit_code);
                }
            }
        }

        Ok(reply.into_output())
    }

    fn submit_reply_for(&self, id: u64) -> String {
        match self.dialect {
            BatchDialect::Slurm => format!("{}\n", id),
            BatchDialect::Lsf => format!("Job <{}> is submitted to default queue <normal>.\n", id),
            BatchDialect::Pbs => format!("{}.pbs\n", id),
            BatchDialect::Torque => format!("{}.torque\n", id),
        }
    }

    fn status(&self, command: &CommandLine) -> CommandOutput {
        let mut state = self.lock();
        if let Some(reply) = state.status_replies.pop_front() {
            state.last_status = Some(reply.clone());
            return reply.into_output();
        }
        let launched = command
            .args
            .iter()
            .find_map(|arg| state.launcher_exits.get(arg).copied());
        let reply = match launched {
            Some(exit_code) => Reply::finished(self.dialect, exit_code),
            None => state
                .last_status
                .clone()
                .unwrap_or_else(|| Reply::absent(self.dialect)),
        };
        reply.into_output()
    }

    fn cancel(&self) -> CommandOutput {
        self.lock()
            .cancel_reply
            .clone()
            .unwrap_or_else(|| Reply::ok(""))
            .into_output()
    }
}

impl CommandRunner for ScriptedScheduler {
    fn run(&self, command: &CommandLine) -> io::Result<CommandOutput> {
        self.lock().invocations.push(command.clone());

        let program = command.program.as_str();
        if program == self.dialect.submit_command(Path::new("x")).program {
            self.submit(command)
        } else if program == self.dialect.status_command("0").program {
            Ok(self.status(command))
        } else if program == self.dialect.cancel_command("0").program {
            Ok(self.cancel())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: command not found", program),
            ))
        }
    }
}

/// Run `<dir>/<name>_launcher.sh`, sending output to `<dir>/<name>.out|.err`.
/// Returns the launcher's exit status, -1 when killed by a signal.
fn run_launcher(launcher: &Path) -> io::Result<i32> {
    let dir = launcher.parent().unwrap_or_else(|| Path::new("."));
    let stem = launcher
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("job");
    let name = stem.strip_suffix("_launcher").unwrap_or(stem);

    let stdout = File::create(dir.join(format!("{}.out", name)))?;
    let stderr = File::create(dir.join(format!("{}.err", name)))?;
    let status = Command::new("sh")
        .arg(launcher)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .status()?;
    Ok(status.code().unwrap_or(-1))
}
