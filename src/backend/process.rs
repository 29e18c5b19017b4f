//! Waiting on and terminating local child processes

use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::BackendError;

/// Cadence of the wait loop
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// How a waited-on process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// The wait was interrupted by run cancellation
    pub cancelled: bool,
}

impl ProcessExit {
    /// Shell convention: exit code, else 128 + signal, else -1
    pub fn returncode(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }
}

/// A spawned local or container process
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    program: String,
}

impl RunningProcess {
    pub fn new(child: Child, program: impl Into<String>) -> Self {
        Self {
            child,
            program: program.into(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Block until the process exits.
    ///
    /// While waiting, `cancel` is checked every 100ms; once set, the process
    /// is sent SIGTERM and killed if it outlives `grace`.
    pub fn wait(mut self, cancel: &AtomicBool, grace: Duration) -> Result<ProcessExit, BackendError> {
        let status = loop {
            if cancel.load(Ordering::SeqCst) {
                debug!(pid = self.pid(), program = %self.program, "terminating on cancellation");
                self.terminate(grace)?;
                let status = self.child.wait()?;
                let mut exit = exit_of(status);
                exit.cancelled = true;
                return Ok(exit);
            }

            match self.child.try_wait()? {
                Some(status) => break status,
                None => std::thread::sleep(WAIT_INTERVAL),
            }
        };

        Ok(exit_of(status))
    }

    /// Terminate the child gracefully then forcefully.
    fn terminate(&mut self, grace: Duration) -> Result<(), BackendError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            match self.child.try_wait()? {
                Some(_) => return Ok(()),
                None => std::thread::sleep(WAIT_INTERVAL),
            }
        }

        warn!(pid = self.pid(), program = %self.program, "process ignored SIGTERM, killing");
        let _ = self.child.kill();
        Ok(())
    }
}

fn exit_of(status: std::process::ExitStatus) -> ProcessExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ProcessExit {
        code: status.code(),
        signal,
        cancelled: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::Arc;

    fn spawn(script: &str) -> RunningProcess {
        let child = Command::new("sh").arg("-c").arg(script).spawn().unwrap();
        RunningProcess::new(child, "sh")
    }

    #[test]
    fn test_wait_reports_exit_code() {
        let cancel = AtomicBool::new(false);
        let exit = spawn("exit 4").wait(&cancel, Duration::from_secs(1)).unwrap();
        assert_eq!(exit.code, Some(4));
        assert_eq!(exit.returncode(), 4);
        assert!(!exit.cancelled);
    }

    #[test]
    fn test_cancel_terminates_process() {
        let cancel = Arc::new(AtomicBool::new(false));
        let process = spawn("sleep 30");

        let flag = Arc::clone(&cancel);
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        let exit = process.wait(&cancel, Duration::from_secs(2)).unwrap();
        setter.join().unwrap();

        assert!(exit.cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
        #[cfg(unix)]
        assert_eq!(exit.returncode(), 128 + 15);
    }

    #[test]
    fn test_returncode_without_status() {
        let exit = ProcessExit {
            code: None,
            signal: None,
            cancelled: false,
        };
        assert_eq!(exit.returncode(), -1);
    }
}
