//! Single-threaded poll loop for asynchronous jobs
//!
//! Workers register a submitted batch job and park on the returned channel.
//! The loop sleeps until the earliest next-poll deadline or until a message
//! arrives, advances every job that is due, and sends terminal jobs back to
//! their workers. A job is never polled from more than one place.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info};

use super::Poller;
use crate::backend::Backend;
use crate::cancel::{cancel_job, JobCancellation};
use crate::job::Job;
use crate::registry::ExecutorConfig;
use crate::timeout::PendingBudget;

/// Slack added to a budget deadline so the wake-up lands past it
const DEADLINE_SLACK: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to start poll loop: {0}")]
    Spawn(#[from] io::Error),

    #[error("poll loop has stopped")]
    Stopped,
}

struct Entry {
    job: Job,
    executor: ExecutorConfig,
    backend: Backend,
    reply: Sender<Job>,
    next_due: Instant,
}

enum Message {
    Register(Box<Entry>),
    CancelAll(Sender<Vec<JobCancellation>>),
    Shutdown,
}

/// Handle to the poll loop thread
#[derive(Debug)]
pub struct PollScheduler {
    tx: Sender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl PollScheduler {
    /// Spawn the poll loop
    pub fn start(poller: Poller) -> Result<Self, SchedulerError> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("hpcrun-poll".to_string())
            .spawn(move || poll_loop(poller, rx))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Hand a submitted job to the loop. The receiver yields the job once
    /// it is terminal.
    pub fn register(
        &self,
        job: Job,
        executor: ExecutorConfig,
        backend: Backend,
    ) -> Result<Receiver<Job>, SchedulerError> {
        let (reply, rx) = mpsc::channel();
        let entry = Entry {
            job,
            executor,
            backend,
            reply,
            next_due: Instant::now(),
        };
        self.tx
            .send(Message::Register(Box::new(entry)))
            .map_err(|_| SchedulerError::Stopped)?;
        Ok(rx)
    }

    /// Cancel every registered job and any job registered afterwards.
    ///
    /// Returns the cancellations performed by this call.
    pub fn cancel_all(&self) -> Vec<JobCancellation> {
        let (tx, rx) = mpsc::channel();
        if self.tx.send(Message::CancelAll(tx)).is_err() {
            return Vec::new();
        }
        rx.recv().unwrap_or_default()
    }

    /// Stop the loop and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(poller: Poller, rx: Receiver<Message>) {
    let mut entries: Vec<Entry> = Vec::new();
    let mut cancelled = false;

    loop {
        let message = match entries.iter().map(|e| e.next_due).min() {
            Some(due) => rx.recv_timeout(due.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match message {
            Ok(Message::Register(entry)) => {
                let mut entry = *entry;
                if cancelled {
                    let result = cancel_job(&mut entry.job, &entry.backend, Utc::now());
                    debug!(job_id = %result.job_id, "cancelled on registration");
                    let _ = entry.reply.send(entry.job);
                } else {
                    debug!(job_id = %entry.job.id, "registered for polling");
                    entries.push(entry);
                }
            }
            Ok(Message::CancelAll(reply)) => {
                cancelled = true;
                let now = Utc::now();
                let results = entries
                    .drain(..)
                    .map(|mut entry| {
                        let result = cancel_job(&mut entry.job, &entry.backend, now);
                        let _ = entry.reply.send(entry.job);
                        result
                    })
                    .collect();
                let _ = reply.send(results);
            }
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                if !entries.is_empty() {
                    info!(remaining = entries.len(), "poll loop stopping with jobs in flight");
                }
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        poll_due(&poller, &mut entries);
    }
}

/// Advance every due entry; hand back the ones that became terminal
fn poll_due(poller: &Poller, entries: &mut Vec<Entry>) {
    let mut i = 0;
    while i < entries.len() {
        if entries[i].next_due > Instant::now() {
            i += 1;
            continue;
        }

        let entry = &mut entries[i];
        poller.advance(&mut entry.job, &entry.executor, &entry.backend);
        if entry.job.is_terminal() {
            let entry = entries.swap_remove(i);
            debug!(job_id = %entry.job.id, state = %entry.job.state, "poll finished");
            let _ = entry.reply.send(entry.job);
            continue;
        }

        entry.next_due = next_due(entry);
        i += 1;
    }
}

/// Next poll at the executor's interval, or just past the pending budget if
/// that comes first
fn next_due(entry: &Entry) -> Instant {
    let now = Instant::now();
    let interval = entry.executor.poll_config().poll_interval();
    match entry.job.submit_time {
        Some(submitted) => {
            let remaining = PendingBudget::new(submitted, entry.executor.max_pending_seconds)
                .remaining(Utc::now());
            now + interval.min(remaining + DEADLINE_SLACK)
        }
        None => now + interval,
    }
}
