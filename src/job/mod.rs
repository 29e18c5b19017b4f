//! Job records
//!
//! A [`Job`] is one attempt to execute one test on one executor. It is
//! created at dispatch, mutated only by the poller and the outcome evaluator,
//! and frozen once it reaches a terminal state. Jobs are plain serializable
//! records: backend handles are stored as opaque [`BackendJobId`] values.

mod spec;
mod state;

pub use spec::{Resources, TestFile, TestFileError, TestSpec};
pub use state::{JobState, JobStateError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Check if a state is terminal (no further transitions possible)
pub trait TerminalState {
    fn is_terminal(&self) -> bool;
}

/// Outcome of a completed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        }
    }

    pub fn parse(value: &str) -> Option<Verdict> {
        match value.to_ascii_uppercase().as_str() {
            "PASS" => Some(Verdict::Pass),
            "FAIL" => Some(Verdict::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier a backend assigned to a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BackendJobId {
    /// Local process id
    Pid(u32),
    /// Batch scheduler job id
    Scheduler(String),
    /// Container name
    Container(String),
}

impl fmt::Display for BackendJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendJobId::Pid(pid) => write!(f, "{}", pid),
            BackendJobId::Scheduler(id) | BackendJobId::Container(id) => f.write_str(id),
        }
    }
}

/// One attempt to execute one test on one executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique job identifier (UUID v4)
    pub id: Uuid,

    /// Build this job belongs to
    pub build_id: u64,

    pub test_name: String,

    /// `<category>/<name>` of the executor
    pub executor_ref: String,

    #[serde(default)]
    pub tags: Vec<String>,

    pub state: JobState,

    /// Present once the job is COMPLETED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,

    /// Present only once submitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_job_id: Option<BackendJobId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,

    pub test_root_path: PathBuf,
    pub output_path: PathBuf,
    pub error_path: PathBuf,

    /// Consecutive failed status queries
    #[serde(default)]
    pub poll_errors: u32,

    /// Whether the backend has reported this job at least once
    #[serde(default)]
    pub observed: bool,

    /// Raw status literal from the most recent poll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backend_status: Option<String>,

    /// Human-readable explanations, oldest first
    #[serde(default)]
    pub diagnostics: Vec<String>,

    /// When the record was last changed
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Allocate a new job in CREATED state for `test` under `tests_root`.
    pub fn new(test: &TestSpec, build_id: u64, tests_root: &Path) -> Self {
        let id = Uuid::new_v4();
        let test_root_path = Self::test_root_for(tests_root, &test.name, &id);
        Self {
            id,
            build_id,
            test_name: test.name.clone(),
            executor_ref: test.executor.clone(),
            tags: test.tags.clone(),
            state: JobState::Created,
            verdict: None,
            backend_job_id: None,
            submit_time: None,
            start_time: None,
            end_time: None,
            returncode: None,
            output_path: test_root_path.join(format!("{}.out", test.name)),
            error_path: test_root_path.join(format!("{}.err", test.name)),
            test_root_path,
            poll_errors: 0,
            observed: false,
            last_backend_status: None,
            diagnostics: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Test root of a job: `<tests_root>/<test_name>/<job id>`.
    pub fn test_root_for(tests_root: &Path, test_name: &str, id: &Uuid) -> PathBuf {
        tests_root.join(test_name).join(id.to_string())
    }

    /// `<test_root>/<name>.sh`
    pub fn script_path(&self) -> PathBuf {
        self.test_root_path.join(format!("{}.sh", self.test_name))
    }

    /// `<test_root>/<name>_launcher.sh` (batch only)
    pub fn launcher_path(&self) -> PathBuf {
        self.test_root_path
            .join(format!("{}_launcher.sh", self.test_name))
    }

    /// Exit status recorded by the batch launcher
    pub fn returncode_path(&self) -> PathBuf {
        self.test_root_path.join("returncode")
    }

    /// `<test_root>/job.json`
    pub fn record_path(&self) -> PathBuf {
        self.test_root_path.join("job.json")
    }

    /// First eight characters of the id
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: JobState) -> Result<(), JobStateError> {
        if !self.state.can_transition_to(new_state) {
            return Err(JobStateError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.state = new_state;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Apply a state reported by a backend.
    ///
    /// Reports that would move the job backwards are ignored and noted in
    /// the diagnostics. Returns whether the report was applied.
    pub fn apply_report(&mut self, reported: JobState) -> bool {
        if self.state == reported && reported == JobState::Pending {
            return true;
        }
        match self.transition(reported) {
            Ok(()) => true,
            Err(_) => {
                if !self.is_terminal() {
                    self.diagnose(format!(
                        "ignored backend report {} while {}",
                        reported, self.state
                    ));
                }
                false
            }
        }
    }

    /// Append a diagnostic line
    pub fn diagnose(&mut self, message: impl Into<String>) {
        self.diagnostics.push(message.into());
        self.updated_at = Utc::now();
    }

    /// Move to a terminal state at `now`, recording why.
    ///
    /// Does nothing if the job is already terminal.
    pub fn terminate(&mut self, state: JobState, now: DateTime<Utc>, reason: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        if self.transition(state).is_ok() {
            self.end_time = Some(now);
            self.diagnose(reason);
        }
    }

    /// Mark the job COMPLETED with the given exit status.
    pub fn complete(&mut self, returncode: i32, now: DateTime<Utc>) -> Result<(), JobStateError> {
        self.transition(JobState::Completed)?;
        self.returncode = Some(returncode);
        if self.start_time.is_none() {
            self.start_time = self.submit_time.or(Some(now));
        }
        self.end_time = Some(now);
        Ok(())
    }

    /// Wall time between start and end, in seconds
    pub fn runtime(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write atomically to file (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> Result<(), JobStateError> {
        let json = self.to_json()?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Load from file
    pub fn from_file(path: &Path) -> Result<Self, JobStateError> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_job() -> Job {
        let test = TestSpec::new("hello", "local/bash", "echo hello");
        Job::new(&test, 7, Path::new("/store/tests"))
    }

    #[test]
    fn test_new_job() {
        let job = make_job();
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.build_id, 7);
        assert_eq!(job.executor_ref, "local/bash");
        assert!(job.backend_job_id.is_none());
        assert_eq!(
            job.test_root_path,
            PathBuf::from(format!("/store/tests/hello/{}", job.id))
        );
        assert_eq!(job.output_path, job.test_root_path.join("hello.out"));
        assert_eq!(job.error_path, job.test_root_path.join("hello.err"));
        assert_eq!(job.script_path(), job.test_root_path.join("hello.sh"));
        assert_eq!(
            job.launcher_path(),
            job.test_root_path.join("hello_launcher.sh")
        );
    }

    #[test]
    fn test_ids_unique() {
        let a = make_job();
        let b = make_job();
        assert_ne!(a.id, b.id);
        assert_ne!(a.test_root_path, b.test_root_path);
    }

    #[test]
    fn test_transition_rejects_backwards() {
        let mut job = make_job();
        job.transition(JobState::Submitted).unwrap();
        job.transition(JobState::Running).unwrap();
        let result = job.transition(JobState::Pending);
        assert!(matches!(
            result,
            Err(JobStateError::InvalidTransition {
                from: JobState::Running,
                to: JobState::Pending
            })
        ));
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn test_apply_report_records_ignored_regression() {
        let mut job = make_job();
        job.transition(JobState::Submitted).unwrap();
        assert!(job.apply_report(JobState::Running));
        assert!(!job.apply_report(JobState::Pending));
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.diagnostics.len(), 1);
        assert!(job.diagnostics[0].contains("ignored backend report PENDING"));
    }

    #[test]
    fn test_apply_report_repeated_pending() {
        let mut job = make_job();
        job.transition(JobState::Submitted).unwrap();
        assert!(job.apply_report(JobState::Pending));
        assert!(job.apply_report(JobState::Pending));
        assert_eq!(job.state, JobState::Pending);
        assert!(job.diagnostics.is_empty());
    }

    #[test]
    fn test_terminate_is_final() {
        let mut job = make_job();
        let now = Utc::now();
        job.transition(JobState::Submitted).unwrap();
        job.terminate(JobState::Timeout, now, "budget exhausted");
        job.terminate(JobState::Cancelled, now, "late cancel");
        assert_eq!(job.state, JobState::Timeout);
        assert_eq!(job.diagnostics, vec!["budget exhausted"]);
        assert_eq!(job.end_time, Some(now));
    }

    #[test]
    fn test_complete_and_runtime() {
        let mut job = make_job();
        let start = Utc::now();
        job.transition(JobState::Submitted).unwrap();
        job.transition(JobState::Running).unwrap();
        job.start_time = Some(start);
        job.complete(0, start + Duration::milliseconds(2500)).unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.returncode, Some(0));
        assert_eq!(job.runtime(), Some(2.5));
    }

    #[test]
    fn test_backend_job_id_serde() {
        let id = BackendJobId::Scheduler("4242".to_string());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"kind":"scheduler","value":"4242"}"#);
        assert_eq!(id.to_string(), "4242");
        assert_eq!(BackendJobId::Pid(12).to_string(), "12");
    }

    #[test]
    fn test_atomic_write_and_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut job = make_job();
        job.diagnose("first line");
        let path = temp.path().join("job.json");
        job.write_to_file(&path).unwrap();

        let loaded = Job::from_file(&path).unwrap();
        assert_eq!(loaded, job);
        assert!(!temp.path().join("job.tmp").exists());
    }
}
