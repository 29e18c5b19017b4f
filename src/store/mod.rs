//! Report and history store
//!
//! The store is the only shared mutable state of a run. It is opened once,
//! passed explicitly to whoever finalizes jobs, and every write happens under
//! an exclusive lock on the store root:
//!
//! ```text
//! <root>/.store.lock               advisory lock
//! <root>/report.jsonl              one finalized job per line
//! <root>/history/next_build_id     build id counter
//! <root>/history/<id>/build.json   build entry
//! <root>/history/<id>/build.log    build log
//! <root>/tests/<name>/<job id>/    test roots
//! ```

mod history;
mod lock;
pub mod query;
mod report;
pub mod resolve;

pub use history::{Build, BuildState};
pub use lock::{LockError, StoreLock, DEFAULT_LOCK_TIMEOUT};
pub use query::{Filter, FormatField, QueryError, ReportQuery, Selection};
pub use resolve::{resolve, ResolveError};

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::job::{Job, JobStateError};

pub const REPORT_FILENAME: &str = "report.jsonl";
pub const HISTORY_DIRNAME: &str = "history";
pub const TESTS_DIRNAME: &str = "tests";

/// Store failures. Any of these during a build aborts it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store lock: {0}")]
    Lock(#[from] LockError),

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt store file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("no build with id {0}")]
    UnknownBuild(u64),

    #[error("build {0} is already finalized")]
    BuildFinalized(u64),

    #[error("job {0} is not terminal")]
    NotTerminal(uuid::Uuid),
}

impl From<JobStateError> for StoreError {
    fn from(e: JobStateError) -> Self {
        match e {
            JobStateError::IoError(e) => StoreError::Io(e),
            JobStateError::JsonError(e) => StoreError::Json(e),
            other => StoreError::Corrupt {
                path: PathBuf::new(),
                reason: other.to_string(),
            },
        }
    }
}

/// Handle to a store root
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    lock_timeout: Duration,
}

impl Store {
    /// Open (creating if needed) the store at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(HISTORY_DIRNAME))?;
        fs::create_dir_all(root.join(TESTS_DIRNAME))?;
        Ok(Self {
            root,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent of all test roots
    pub fn tests_root(&self) -> PathBuf {
        self.root.join(TESTS_DIRNAME)
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join(REPORT_FILENAME)
    }

    fn history_dir(&self) -> PathBuf {
        self.root.join(HISTORY_DIRNAME)
    }

    fn lock(&self) -> Result<StoreLock, StoreError> {
        Ok(StoreLock::acquire(&self.root, self.lock_timeout)?)
    }

    /// Allocate a build id and record an IN_PROGRESS build
    pub fn begin_build(&self, command: &str) -> Result<Build, StoreError> {
        let _lock = self.lock()?;
        let history = self.history_dir();
        let build_id = history::allocate_id(&history)?;
        let log_path = history::build_dir(&history, build_id).join(history::LOG_FILENAME);
        let build = Build::new(build_id, command, log_path);
        history::write_build(&history, &build)?;
        info!(build_id, "build started");
        Ok(build)
    }

    /// Record a terminal job: append it to the report, add it to its build
    /// and write its `job.json`.
    pub fn finalize(&self, job: &Job) -> Result<(), StoreError> {
        if !job.is_terminal() {
            return Err(StoreError::NotTerminal(job.id));
        }

        let _lock = self.lock()?;
        let history = self.history_dir();
        let mut build = history::read_build(&history, job.build_id)?;
        if build.is_complete() {
            return Err(StoreError::BuildFinalized(build.build_id));
        }

        report::append(&self.report_path(), job)?;
        if !build.job_ids.contains(&job.id) {
            build.job_ids.push(job.id);
        }
        history::write_build(&history, &build)?;

        fs::create_dir_all(&job.test_root_path)?;
        job.write_to_file(&job.record_path())?;

        debug!(job_id = %job.id, build_id = job.build_id, state = %job.state, "finalized");
        Ok(())
    }

    /// Mark a build finished. Only an IN_PROGRESS build can be completed.
    pub fn complete_build(&self, build_id: u64, state: BuildState) -> Result<Build, StoreError> {
        let _lock = self.lock()?;
        let history = self.history_dir();
        let mut build = history::read_build(&history, build_id)?;
        if build.is_complete() {
            return Err(StoreError::BuildFinalized(build_id));
        }
        build.state = state;
        build.end_time = Some(Utc::now());
        history::write_build(&history, &build)?;
        info!(build_id, state = %state, jobs = build.job_ids.len(), "build finished");
        Ok(build)
    }

    /// Append a line to the build log
    pub fn log_build(&self, build: &Build, line: &str) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&build.log_path)?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)?;
        Ok(())
    }

    /// Every readable report record, in recording order
    pub fn reports(&self) -> Result<Vec<Job>, StoreError> {
        report::read_all(&self.report_path())
    }

    pub fn build(&self, build_id: u64) -> Result<Build, StoreError> {
        history::read_build(&self.history_dir(), build_id)
    }

    /// Builds by id. IN_PROGRESS builds are hidden unless `include_incomplete`.
    pub fn list_builds(&self, include_incomplete: bool) -> Result<Vec<Build>, StoreError> {
        let history = self.history_dir();
        let mut builds = Vec::new();
        for id in history::existing_ids(&history)? {
            match history::read_build(&history, id) {
                Ok(build) if include_incomplete || build.is_complete() => builds.push(build),
                Ok(_) => {}
                // Directory created but build.json not yet written
                Err(StoreError::UnknownBuild(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(builds)
    }

    /// Builds left IN_PROGRESS, e.g. by a crash
    pub fn recover_incomplete(&self) -> Result<Vec<Build>, StoreError> {
        Ok(self
            .list_builds(true)?
            .into_iter()
            .filter(|b| !b.is_complete())
            .collect())
    }

    /// Remove a history entry. Its id is never handed out again.
    pub fn delete_build(&self, build_id: u64) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let dir = history::build_dir(&self.history_dir(), build_id);
        if !dir.exists() {
            return Err(StoreError::UnknownBuild(build_id));
        }
        fs::remove_dir_all(&dir)?;
        info!(build_id, "build deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, TestSpec};
    use tempfile::TempDir;

    fn terminal_job(store: &Store, build: &Build, name: &str) -> Job {
        let mut job = Job::new(&TestSpec::new(name, "local/sh", "true"), build.build_id, &store.tests_root());
        job.transition(JobState::Submitted).unwrap();
        job.complete(0, Utc::now()).unwrap();
        job
    }

    #[test]
    fn test_open_creates_layout() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join("store")).unwrap();
        assert!(store.tests_root().is_dir());
        assert!(store.root().join(HISTORY_DIRNAME).is_dir());
    }

    #[test]
    fn test_build_lifecycle() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();

        let build = store.begin_build("hpcrun run t.toml").unwrap();
        assert_eq!(build.build_id, 0);
        assert!(store.list_builds(false).unwrap().is_empty());
        assert_eq!(store.recover_incomplete().unwrap().len(), 1);

        let job = terminal_job(&store, &build, "a");
        store.finalize(&job).unwrap();
        assert!(job.record_path().exists());

        let done = store.complete_build(build.build_id, BuildState::Complete).unwrap();
        assert_eq!(done.job_ids, vec![job.id]);
        assert!(done.end_time.is_some());
        assert_eq!(store.list_builds(false).unwrap(), vec![done]);
        assert!(store.recover_incomplete().unwrap().is_empty());
        assert_eq!(store.reports().unwrap(), vec![job]);
    }

    #[test]
    fn test_finalize_rejects_non_terminal() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let build = store.begin_build("x").unwrap();
        let job = Job::new(&TestSpec::new("a", "local/sh", "true"), build.build_id, &store.tests_root());
        assert!(matches!(store.finalize(&job), Err(StoreError::NotTerminal(_))));
    }

    #[test]
    fn test_finalize_after_completion_rejected() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let build = store.begin_build("x").unwrap();
        store.complete_build(build.build_id, BuildState::Complete).unwrap();

        let job = terminal_job(&store, &build, "late");
        assert!(matches!(store.finalize(&job), Err(StoreError::BuildFinalized(0))));
        assert!(matches!(
            store.complete_build(build.build_id, BuildState::Aborted),
            Err(StoreError::BuildFinalized(0))
        ));
    }

    #[test]
    fn test_deleted_id_not_reused() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let first = store.begin_build("a").unwrap();
        let second = store.begin_build("b").unwrap();
        store.delete_build(second.build_id).unwrap();
        store.delete_build(first.build_id).unwrap();

        assert_eq!(store.begin_build("c").unwrap().build_id, 2);
        assert!(matches!(store.delete_build(9), Err(StoreError::UnknownBuild(9))));
    }

    #[test]
    fn test_build_log() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let build = store.begin_build("x").unwrap();
        store.log_build(&build, "hello").unwrap();
        let log = fs::read_to_string(&build.log_path).unwrap();
        assert!(log.trim_end().ends_with(" hello"));
    }
}
