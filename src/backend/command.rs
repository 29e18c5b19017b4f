//! Running scheduler and runtime command lines
//!
//! Batch backends never spawn scheduler CLIs directly; they go through a
//! [`CommandRunner`] so tests can substitute a scripted scheduler.

use std::fs::File;
use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hpcrun_dialect::CommandLine;
use tracing::warn;

use crate::config::DEFAULT_COMMAND_TIMEOUT_SECONDS;

/// Cadence of the exit check
const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined for diagnostics
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (false, false) => format!("{}\n{}", stdout, stderr),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Runs a command line to completion and captures its output
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandLine) -> io::Result<CommandOutput>;
}

/// Runs commands on the local system.
///
/// A command still running after the timeout is killed and reported as an
/// [`io::ErrorKind::TimedOut`] error, so a wedged `sacct` or `qstat` counts
/// as a failed query instead of stalling the poll loop.
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECONDS))
    }
}

impl SystemRunner {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandLine) -> io::Result<CommandOutput> {
        let stdin = match command.stdin {
            Some(ref path) => Stdio::from(File::open(path)?),
            None => Stdio::null(),
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes while waiting so a chatty command cannot block
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                warn!(
                    command = %command,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "command timed out; killed"
                );
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("did not finish within {}s", self.timeout.as_secs_f64()),
                ));
            }
            thread::sleep(WAIT_INTERVAL);
        };

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
