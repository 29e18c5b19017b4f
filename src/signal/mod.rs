//! SIGINT/SIGTERM handling
//!
//! The first signal cancels the run: the poll loop cancels in-flight batch
//! jobs at their scheduler, local and container processes get SIGTERM and
//! then SIGKILL after the grace period, unfinished jobs are recorded as
//! CANCELLED and the build closes as CANCELLED with [`EXIT_CODE_CANCELLED`].
//!
//! A second signal exits on the spot. The build stays IN_PROGRESS and is
//! reported by `Store::recover_incomplete`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::config::DEFAULT_TERMINATION_GRACE_SECONDS;

/// Exit code for cancelled runs
pub const EXIT_CODE_CANCELLED: i32 = 80;

/// What a delivered signal means for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal
    Cancel,
    /// Second signal
    Exit,
    /// Anything after that
    Ignore,
}

/// Cancellation state shared by the handler, the collector and the workers
#[derive(Debug)]
pub struct SignalState {
    cancelled: Arc<AtomicBool>,
    received: AtomicU8,
    in_flight: Mutex<BTreeSet<Uuid>>,
    grace_period: Duration,
}

impl SignalState {
    pub fn new() -> Self {
        Self::with_grace_period(Duration::from_secs(DEFAULT_TERMINATION_GRACE_SECONDS))
    }

    /// `grace_period` is how long a signalled process gets before SIGKILL
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            received: AtomicU8::new(0),
            in_flight: Mutex::new(BTreeSet::new()),
            grace_period,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Signals delivered so far
    pub fn signals_received(&self) -> u8 {
        self.received.load(Ordering::SeqCst)
    }

    /// The flag process waits watch
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Cancel without a signal
    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Count a delivered signal
    pub fn on_signal(&self) -> SignalAction {
        let previous = self
            .received
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
            .unwrap_or(u8::MAX);
        match previous {
            0 => {
                self.request_cancel();
                SignalAction::Cancel
            }
            1 => SignalAction::Exit,
            _ => SignalAction::Ignore,
        }
    }

    pub fn register_job(&self, job_id: Uuid) {
        if let Ok(mut jobs) = self.in_flight.lock() {
            jobs.insert(job_id);
        }
    }

    pub fn unregister_job(&self, job_id: &Uuid) {
        if let Ok(mut jobs) = self.in_flight.lock() {
            jobs.remove(job_id);
        }
    }

    /// Jobs dispatched but not yet finalized
    pub fn in_flight(&self) -> Vec<Uuid> {
        self.in_flight
            .lock()
            .map(|jobs| jobs.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of the process-wide handler
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn with_state(state: Arc<SignalState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install the SIGINT/SIGTERM handler. Only one may be installed per
    /// process.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = self.state();
        ctrlc::set_handler(move || match state.on_signal() {
            SignalAction::Cancel => {
                eprintln!("\nInterrupted: cancelling in-flight jobs (interrupt again to exit now)");
            }
            SignalAction::Exit => {
                eprintln!("\nSecond interrupt: exiting without waiting for jobs");
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            SignalAction::Ignore => {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state() {
        let state = SignalState::new();
        assert!(!state.is_cancel_requested());
        assert_eq!(state.signals_received(), 0);
        assert_eq!(
            state.grace_period(),
            Duration::from_secs(DEFAULT_TERMINATION_GRACE_SECONDS)
        );
        assert!(state.in_flight().is_empty());
    }

    #[test]
    fn test_first_signal_cancels_second_exits() {
        let state = SignalState::with_grace_period(Duration::from_secs(1));
        assert_eq!(state.on_signal(), SignalAction::Cancel);
        assert!(state.is_cancel_requested());
        assert_eq!(state.on_signal(), SignalAction::Exit);
        assert_eq!(state.on_signal(), SignalAction::Ignore);
        assert_eq!(state.signals_received(), 3);
    }

    #[test]
    fn test_request_cancel_sets_shared_flag() {
        let state = SignalState::new();
        let flag = state.cancel_flag();
        state.request_cancel();
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(state.signals_received(), 0);
    }

    #[test]
    fn test_in_flight_tracking() {
        let state = SignalState::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        state.register_job(a);
        state.register_job(b);
        state.unregister_job(&a);
        assert_eq!(state.in_flight(), vec![b]);
    }
}
