//! hpcrun - test execution across local shells, batch schedulers and containers
//!
//! This crate dispatches resolved tests to named executors, tracks every job
//! to a terminal state by polling its backend, evaluates the outcome against
//! the test's pass criteria, and records each result in a locked report and
//! history store.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod evaluate;
pub mod job;
pub mod mock;
pub mod poller;
pub mod registry;
pub mod runner;
pub mod signal;
pub mod store;
pub mod timeout;

pub use job::{Job, JobState, TestFile, TestSpec, Verdict};
pub use registry::{ExecutorConfig, ExecutorRegistry};
pub use runner::{BuildSummary, RunError, RunOptions, RunOutcome, Runner};
pub use store::{Build, BuildState, Store, StoreError};
