//! Build orchestration
//!
//! A run turns a list of resolved tests into one build:
//! - resolve every executor reference up front
//! - open a build in the store
//! - dispatch tests from a bounded worker pool; each worker owns its job
//!   from dispatch to finalization
//! - hand asynchronous jobs to the poll loop and park until they are terminal
//! - evaluate, finalize, and close the build
//!
//! Job-level failures end up on the job record. Only store failures and the
//! inability to start any worker abort the build.

mod summary;

pub use summary::BuildSummary;

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::CommandRunner;
use crate::cancel::RunCancellation;
use crate::dispatch::{Dispatched, Dispatcher};
use crate::evaluate::evaluate;
use crate::job::{Job, JobState, TestSpec, Verdict};
use crate::poller::{PollScheduler, Poller, SchedulerError};
use crate::registry::{ExecutorConfig, ExecutorRegistry, RegistryError};
use crate::signal::SignalState;
use crate::store::{Build, BuildState, Store, StoreError};

/// How often the collector checks for cancellation
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("executor error: {0}")]
    Registry(#[from] RegistryError),

    #[error("store error, build aborted: {0}")]
    Persistence(#[from] StoreError),

    #[error("poll loop error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("could not start worker pool: {0}")]
    Pool(#[source] io::Error),
}

/// Run settings
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Command line recorded in the build history
    pub command: String,
    pub pool_size: usize,
    pub max_poll_errors: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            command: "hpcrun run".to_string(),
            pool_size: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            max_poll_errors: crate::config::DEFAULT_MAX_POLL_ERRORS,
        }
    }
}

/// Result of a finished build
#[derive(Debug)]
pub struct RunOutcome {
    pub build: Build,
    /// Finalized jobs in finalization order
    pub jobs: Vec<Job>,
    pub summary: BuildSummary,
    /// Present when the run was cancelled
    pub cancellation: Option<RunCancellation>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }
}

type WorkItem = (TestSpec, ExecutorConfig);

/// Runs builds against one store
pub struct Runner {
    store: Store,
    registry: ExecutorRegistry,
    commands: Arc<dyn CommandRunner>,
    signal: Arc<SignalState>,
    options: RunOptions,
}

impl Runner {
    pub fn new(
        store: Store,
        registry: ExecutorRegistry,
        commands: Arc<dyn CommandRunner>,
        options: RunOptions,
    ) -> Self {
        Self {
            store,
            registry,
            commands,
            signal: Arc::new(SignalState::new()),
            options,
        }
    }

    /// Share cancellation state with a signal handler
    pub fn with_signal_state(mut self, signal: Arc<SignalState>) -> Self {
        self.signal = signal;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run `tests` as one build
    pub fn run(&self, tests: &[TestSpec]) -> Result<RunOutcome, RunError> {
        let started = Instant::now();

        let mut work: Vec<WorkItem> = Vec::with_capacity(tests.len());
        for test in tests {
            let executor = self.registry.resolve(&test.executor)?;
            work.push((test.clone(), executor.clone()));
        }

        let build = self.store.begin_build(&self.options.command)?;
        self.log(&build, &format!("command: {}", build.command));

        let scheduler = match PollScheduler::start(Poller::new(self.options.max_poll_errors)) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.abort(&build);
                return Err(e.into());
            }
        };
        let dispatcher = Dispatcher::new(self.store.tests_root(), Arc::clone(&self.commands));

        let total = work.len();
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>();
        for item in work {
            // The receiver is alive until the scope below ends
            let _ = work_tx.send(item);
        }
        drop(work_tx);
        let work_rx = Mutex::new(work_rx);

        let pool_size = self.options.pool_size.max(1).min(total.max(1));
        info!(
            build_id = build.build_id,
            tests = total,
            pool_size,
            "build running"
        );

        let (done_tx, done_rx) = mpsc::channel::<(Job, Result<(), StoreError>)>();
        let worker = Worker {
            store: &self.store,
            dispatcher: &dispatcher,
            scheduler: &scheduler,
            signal: &self.signal,
            build_id: build.build_id,
        };

        let collected = thread::scope(|scope| {
            let mut spawned = 0;
            for index in 0..pool_size {
                let done_tx = done_tx.clone();
                let work_rx = &work_rx;
                let worker = &worker;
                let spawn = thread::Builder::new()
                    .name(format!("hpcrun-worker-{}", index))
                    .spawn_scoped(scope, move || worker.drain(work_rx, done_tx));
                match spawn {
                    Ok(_) => spawned += 1,
                    Err(e) if spawned == 0 => return Err(e),
                    Err(e) => {
                        warn!(error = %e, spawned, "worker pool smaller than requested");
                        break;
                    }
                }
            }
            drop(done_tx);
            Ok(self.collect(&build, &scheduler, done_rx, total))
        });

        scheduler.shutdown();

        let (jobs, persistence_error, cancellation) = match collected {
            Ok(collected) => collected,
            Err(e) => {
                self.abort(&build);
                return Err(RunError::Pool(e));
            }
        };

        if let Some(e) = persistence_error {
            self.abort(&build);
            return Err(RunError::Persistence(e));
        }

        let state = if cancellation.is_some() {
            BuildState::Cancelled
        } else {
            BuildState::Complete
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let summary = BuildSummary::from_jobs(build.build_id, state, &jobs, duration_ms);
        self.log(&build, &summary.human_summary);

        let build = match self.store.complete_build(build.build_id, state) {
            Ok(build) => build,
            Err(e) => {
                self.abort(&build);
                return Err(RunError::Persistence(e));
            }
        };

        Ok(RunOutcome {
            build,
            jobs,
            summary,
            cancellation,
        })
    }

    /// Gather finalized jobs; cancel in-flight work once if asked to.
    fn collect(
        &self,
        build: &Build,
        scheduler: &PollScheduler,
        done: Receiver<(Job, Result<(), StoreError>)>,
        total: usize,
    ) -> (Vec<Job>, Option<StoreError>, Option<RunCancellation>) {
        let mut jobs = Vec::with_capacity(total);
        let mut persistence_error = None;
        let mut cancellation: Option<RunCancellation> = None;

        while jobs.len() < total {
            match done.recv_timeout(COLLECT_INTERVAL) {
                Ok((job, result)) => {
                    self.log(build, &job_line(&job));
                    if let Err(e) = result {
                        error!(build_id = build.build_id, job_id = %job.id, error = %e, "failed to record job");
                        if persistence_error.is_none() {
                            // Stop the rest of the build; nothing more can be recorded
                            self.signal.request_cancel();
                            persistence_error = Some(e);
                        }
                    }
                    jobs.push(job);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.signal.is_cancel_requested() && cancellation.is_none() {
                let mut run = RunCancellation::new(build.build_id);
                run.extend(scheduler.cancel_all());
                info!(
                    build_id = build.build_id,
                    in_flight = self.signal.in_flight().len(),
                    "{}",
                    run.summary()
                );
                self.log(build, &run.summary());
                cancellation = Some(run);
            }
        }

        if persistence_error.is_some() {
            cancellation = None;
        }
        (jobs, persistence_error, cancellation)
    }

    fn abort(&self, build: &Build) {
        if let Err(e) = self.store.complete_build(build.build_id, BuildState::Aborted) {
            error!(build_id = build.build_id, error = %e, "could not mark build aborted");
        }
    }

    fn log(&self, build: &Build, line: &str) {
        if let Err(e) = self.store.log_build(build, line) {
            warn!(build_id = build.build_id, error = %e, "could not write build log");
        }
    }
}

fn job_line(job: &Job) -> String {
    let verdict = job.verdict.map(|v| v.as_str()).unwrap_or("-");
    let mut line = format!(
        "{} {} {} {} {}",
        job.test_name, job.id, job.executor_ref, job.state, verdict
    );
    if let Some(reason) = job.diagnostics.last() {
        line.push_str(": ");
        line.push_str(reason);
    }
    line
}

/// What each pool thread needs
struct Worker<'a> {
    store: &'a Store,
    dispatcher: &'a Dispatcher,
    scheduler: &'a PollScheduler,
    signal: &'a SignalState,
    build_id: u64,
}

impl Worker<'_> {
    fn drain(
        &self,
        work: &Mutex<Receiver<WorkItem>>,
        done: mpsc::Sender<(Job, Result<(), StoreError>)>,
    ) {
        loop {
            let next = match work.lock() {
                Ok(rx) => rx.recv(),
                Err(_) => return,
            };
            let Ok((test, executor)) = next else {
                return;
            };

            let job = self.execute(&test, &executor);
            let result = self.store.finalize(&job);
            self.signal.unregister_job(&job.id);
            if done.send((job, result)).is_err() {
                return;
            }
        }
    }

    /// Take one test from dispatch to a terminal, evaluated job
    fn execute(&self, test: &TestSpec, executor: &ExecutorConfig) -> Job {
        if self.signal.is_cancel_requested() {
            let mut job = Job::new(test, self.build_id, self.dispatcher.tests_root());
            job.executor_ref = executor.reference();
            job.terminate(JobState::Cancelled, Utc::now(), "run cancelled before dispatch");
            return job;
        }

        let Dispatched {
            mut job,
            backend,
            process,
        } = self.dispatcher.submit(test, executor, self.build_id);
        if job.is_terminal() {
            return job;
        }
        self.signal.register_job(job.id);

        match process {
            Some(process) => {
                if job.transition(JobState::Running).is_ok() {
                    job.start_time = Some(Utc::now());
                }
                let cancel = self.signal.cancel_flag();
                match process.wait(&cancel, self.signal.grace_period()) {
                    Ok(exit) => Poller::default().complete_sync(&mut job, exit),
                    Err(e) => job.terminate(
                        JobState::PollError,
                        Utc::now(),
                        format!("lost track of process: {}", e),
                    ),
                }
            }
            None => {
                let id = job.id;
                match self.scheduler.register(job.clone(), executor.clone(), backend) {
                    Ok(rx) => match rx.recv() {
                        Ok(finished) => job = finished,
                        Err(_) => job.terminate(
                            JobState::PollError,
                            Utc::now(),
                            "poll loop stopped before the job finished",
                        ),
                    },
                    Err(e) => job.terminate(JobState::PollError, Utc::now(), e.to_string()),
                }
                debug!(job_id = %id, state = %job.state, "async job returned");
            }
        }

        if job.state == JobState::Completed {
            job.verdict = Some(match evaluate(&job, test.status.as_ref()) {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(job_id = %job.id, test = %job.test_name, error = %e, "evaluation failed");
                    job.diagnose(format!("evaluation failed: {}", e));
                    Verdict::Fail
                }
            });
        }

        info!(
            job_id = %job.id,
            test = %job.test_name,
            executor = %job.executor_ref,
            state = %job.state,
            verdict = job.verdict.map(|v| v.as_str()).unwrap_or("-"),
            "job finished"
        );
        job
    }
}
