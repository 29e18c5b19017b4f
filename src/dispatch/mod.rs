//! Job dispatch
//!
//! Builds the test root of a new job, renders its scripts, and hands it to
//! the executor's backend. The test root exists before submission so the
//! backend writes output straight into it:
//!
//! ```text
//! <tests_root>/<name>/<job id>/
//!   <name>.sh            test script: shebang, exports, command
//!   <name>_launcher.sh   batch only: directives, runs <name>.sh, records exit status
//!   <name>.out           stdout
//!   <name>.err           stderr
//!   returncode           batch only, written by the launcher
//!   job.json             job record
//! ```
//!
//! A failed submission is terminal (`FAILED_TO_SUBMIT`) and never retried.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use hpcrun_dialect::BatchRequest;
use tracing::{debug, info, warn};

use crate::backend::{Backend, CommandRunner, ExecutionBackend, RunningProcess};
use crate::job::{Job, JobState, TestSpec};
use crate::registry::ExecutorConfig;

/// A job handed to its backend
#[derive(Debug)]
pub struct Dispatched {
    /// SUBMITTED or FAILED_TO_SUBMIT
    pub job: Job,
    pub backend: Backend,
    /// Live process for synchronous backends
    pub process: Option<RunningProcess>,
}

/// Creates jobs and submits them
#[derive(Clone)]
pub struct Dispatcher {
    tests_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tests_root", &self.tests_root)
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher placing test roots under `tests_root`. Scheduler and
    /// container CLIs run through `runner`.
    pub fn new(tests_root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tests_root: tests_root.into(),
            runner,
        }
    }

    pub fn tests_root(&self) -> &Path {
        &self.tests_root
    }

    /// Allocate a job for `test`, prepare its test root and submit it.
    pub fn submit(&self, test: &TestSpec, executor: &ExecutorConfig, build_id: u64) -> Dispatched {
        let mut job = Job::new(test, build_id, &self.tests_root);
        job.executor_ref = executor.reference();
        let backend = Backend::for_executor(executor, self.runner.clone());

        if let Err(e) = prepare_test_root(&job, test, executor) {
            job.submit_time = Some(Utc::now());
            job.terminate(
                JobState::FailedToSubmit,
                Utc::now(),
                format!("failed to prepare test root: {}", e),
            );
            warn!(job_id = %job.id, test = %job.test_name, error = %e, "test root preparation failed");
            return Dispatched {
                job,
                backend,
                process: None,
            };
        }

        job.submit_time = Some(Utc::now());
        match backend.submit(&job) {
            Ok(submission) => {
                info!(
                    job_id = %job.id,
                    test = %job.test_name,
                    executor = %job.executor_ref,
                    backend_id = %submission.backend_job_id,
                    "submitted"
                );
                job.backend_job_id = Some(submission.backend_job_id);
                // CREATED -> SUBMITTED is always legal
                let _ = job.transition(JobState::Submitted);
                Dispatched {
                    job,
                    backend,
                    process: submission.process,
                }
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    test = %job.test_name,
                    executor = %job.executor_ref,
                    error = %e,
                    "submission failed"
                );
                job.terminate(
                    JobState::FailedToSubmit,
                    Utc::now(),
                    format!("submission failed: {}", e),
                );
                Dispatched {
                    job,
                    backend,
                    process: None,
                }
            }
        }
    }
}

/// Create the test root and write the scripts the backend needs
fn prepare_test_root(job: &Job, test: &TestSpec, executor: &ExecutorConfig) -> io::Result<()> {
    fs::create_dir_all(&job.test_root_path)?;

    let script = render_test_script(test, &executor.shell);
    write_executable(&job.script_path(), &script)?;

    if let Some(dialect) = executor.category.dialect() {
        let mut options = executor.options.clone();
        options.extend(test.resources.options.iter().cloned());
        let request = BatchRequest {
            job_name: test.name.clone(),
            output_path: job.output_path.clone(),
            error_path: job.error_path.clone(),
            queue: executor.queue.clone(),
            account: executor.account.clone(),
            qos: executor.qos.clone(),
            nodes: test.resources.nodes,
            procs: test.resources.procs,
            time_limit_minutes: test.resources.time_limit_minutes,
            options,
        };
        let launcher = render_launcher(job, &dialect.directives(&request), &executor.shell);
        write_executable(&job.launcher_path(), &launcher)?;
    }

    debug!(job_id = %job.id, root = %job.test_root_path.display(), "test root prepared");
    Ok(())
}

/// Test script: shebang, environment exports, then the command
pub fn render_test_script(test: &TestSpec, shell: &str) -> String {
    let mut script = format!("#!/usr/bin/env {}\n", shell);
    for (key, value) in &test.env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script.push_str(&test.command);
    if !test.command.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// Batch launcher: directives, then run the test script, record its exit
/// status where the poller can find it and exit with it so the scheduler
/// reports the same code
fn render_launcher(job: &Job, directives: &[String], shell: &str) -> String {
    let root = job.test_root_path.display().to_string();
    let mut launcher = String::from("#!/bin/sh\n");
    for line in directives {
        launcher.push_str(line);
        launcher.push('\n');
    }
    launcher.push_str(&format!("cd {}\n", shell_quote(&root)));
    launcher.push_str(&format!(
        "{} {}\n",
        shell,
        shell_quote(&job.script_path().display().to_string())
    ));
    launcher.push_str("rc=$?\n");
    launcher.push_str(&format!(
        "echo $rc > {}\n",
        shell_quote(&job.returncode_path().display().to_string())
    ));
    launcher.push_str("exit $rc\n");
    launcher
}

/// Single-quote `value` for POSIX shells
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn write_executable(path: &Path, content: &str) -> io::Result<()> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
