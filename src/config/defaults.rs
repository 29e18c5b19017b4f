//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::timeout::{DEFAULT_MAX_PENDING_SECONDS, DEFAULT_POLL_INTERVAL_SECONDS};

/// Default number of consecutive failed status queries tolerated per job
pub const DEFAULT_MAX_POLL_ERRORS: u32 = 3;

/// Default SIGTERM-to-SIGKILL grace period for local and container jobs
pub const DEFAULT_TERMINATION_GRACE_SECONDS: u64 = 10;

/// Default deadline for one scheduler or container runtime command
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 60;

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Store root (default: `$HOME/.hpcrun`, or `.hpcrun` without a home)
    pub root: PathBuf,

    /// Concurrent jobs (default: available parallelism)
    pub pool_size: usize,

    pub max_poll_errors: u32,

    pub termination_grace_seconds: u64,

    pub command_timeout_seconds: u64,

    pub poll_interval_seconds: u64,

    pub max_pending_seconds: u64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        let root = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".hpcrun"))
            .unwrap_or_else(|| PathBuf::from(".hpcrun"));
        let pool_size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            root,
            pool_size,
            max_poll_errors: DEFAULT_MAX_POLL_ERRORS,
            termination_grace_seconds: DEFAULT_TERMINATION_GRACE_SECONDS,
            command_timeout_seconds: DEFAULT_COMMAND_TIMEOUT_SECONDS,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            max_pending_seconds: DEFAULT_MAX_PENDING_SECONDS,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging.
    ///
    /// Ships the two local executors every installation has.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "root": self.root.to_string_lossy(),
            "pool_size": self.pool_size,
            "max_poll_errors": self.max_poll_errors,
            "termination_grace_seconds": self.termination_grace_seconds,
            "command_timeout_seconds": self.command_timeout_seconds,
            "executors": {
                "defaults": {
                    "poll_interval_seconds": self.poll_interval_seconds,
                    "max_pending_seconds": self.max_pending_seconds
                },
                "local": {
                    "bash": {
                        "description": "submit jobs on local machine using bash shell",
                        "shell": "bash"
                    },
                    "sh": {
                        "description": "submit jobs on local machine using sh shell",
                        "shell": "sh"
                    }
                }
            }
        })
    }
}
