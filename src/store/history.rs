//! Build history
//!
//! One directory per build under `<root>/history/<build id>/` holding
//! `build.json` and the build log. Build ids come from a counter file that
//! only ever grows, so a deleted build never gives its id back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StoreError;
use crate::job::TerminalState;

pub(crate) const COUNTER_FILENAME: &str = "next_build_id";
pub(crate) const BUILD_FILENAME: &str = "build.json";
pub(crate) const LOG_FILENAME: &str = "build.log";

/// Lifecycle of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    InProgress,
    Complete,
    /// The build stopped on a store failure
    Aborted,
    /// The run was interrupted
    Cancelled,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::InProgress => "IN_PROGRESS",
            BuildState::Complete => "COMPLETE",
            BuildState::Aborted => "ABORTED",
            BuildState::Cancelled => "CANCELLED",
        }
    }
}

impl TerminalState for BuildState {
    fn is_terminal(&self) -> bool {
        !matches!(self, BuildState::InProgress)
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One history entry: every job run by one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub build_id: u64,
    /// Command line of the invocation
    pub command: String,
    pub user: String,
    pub hostname: String,
    pub platform: String,
    pub state: BuildState,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Finalized jobs, in finalization order
    #[serde(default)]
    pub job_ids: Vec<Uuid>,
    pub log_path: PathBuf,
}

impl Build {
    pub(crate) fn new(build_id: u64, command: &str, log_path: PathBuf) -> Self {
        Self {
            build_id,
            command: command.to_string(),
            user: current_user(),
            hostname: current_hostname(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            state: BuildState::InProgress,
            start_time: Utc::now(),
            end_time: None,
            job_ids: Vec::new(),
            log_path,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }
}

pub(crate) fn build_dir(history: &Path, build_id: u64) -> PathBuf {
    history.join(build_id.to_string())
}

/// Take the next build id. Caller holds the store lock.
pub(crate) fn allocate_id(history: &Path) -> Result<u64, StoreError> {
    fs::create_dir_all(history)?;
    let counter_path = history.join(COUNTER_FILENAME);
    let counter = match fs::read_to_string(&counter_path) {
        Ok(content) => content
            .trim()
            .parse::<u64>()
            .map_err(|_| StoreError::Corrupt {
                path: counter_path.clone(),
                reason: format!("not a build id: '{}'", content.trim()),
            })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    // Never hand out an id that already has a directory
    let next = existing_ids(history)?
        .into_iter()
        .map(|id| id + 1)
        .chain(std::iter::once(counter))
        .max()
        .unwrap_or(counter);

    write_atomic(&counter_path, format!("{}\n", next + 1).as_bytes())?;
    Ok(next)
}

/// Ids of all build directories, ascending
pub(crate) fn existing_ids(history: &Path) -> Result<Vec<u64>, StoreError> {
    let entries = match fs::read_dir(history) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

pub(crate) fn write_build(history: &Path, build: &Build) -> Result<(), StoreError> {
    let dir = build_dir(history, build.build_id);
    fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(build)?;
    write_atomic(&dir.join(BUILD_FILENAME), json.as_bytes())?;
    Ok(())
}

pub(crate) fn read_build(history: &Path, build_id: u64) -> Result<Build, StoreError> {
    let path = build_dir(history, build_id).join(BUILD_FILENAME);
    let json = match fs::read_to_string(&path) {
        Ok(json) => json,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::UnknownBuild(build_id))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_str(&json)?)
}

/// Write-then-rename so readers never see a partial file
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn current_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(not(unix))]
fn current_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}
