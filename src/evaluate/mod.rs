//! Outcome evaluation
//!
//! Turns a completed job into a PASS/FAIL verdict. With no declared criteria
//! a job passes when it exits 0. Declared checks (return code, output regex,
//! runtime bounds) are combined with `all` (default) or `any`.
//!
//! Evaluation reads the captured output files but never talks to a backend.

use std::fs;
use std::io;
use std::path::PathBuf;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::job::{Job, Verdict};

/// Return code a job reports when its real exit status is unknown
pub const UNKNOWN_RETURNCODE: i32 = -1;

/// Expected return code(s)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReturnCodeMatch {
    Exact(i32),
    AnyOf(Vec<i32>),
}

impl ReturnCodeMatch {
    pub fn matches(&self, code: i32) -> bool {
        match self {
            ReturnCodeMatch::Exact(expected) => *expected == code,
            ReturnCodeMatch::AnyOf(set) => set.contains(&code),
        }
    }
}

/// Captured stream a regex is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegexCheck {
    pub stream: Stream,
    pub exp: String,
}

/// Inclusive runtime bounds in seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// How declared checks combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    #[default]
    All,
    Any,
}

/// Declared pass criteria of a test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<ReturnCodeMatch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<RegexCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeBounds>,

    #[serde(default)]
    pub mode: CheckMode,
}

/// Malformed pass criteria
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("invalid regex '{exp}': {source}")]
    InvalidRegex {
        exp: String,
        source: regex_lite::Error,
    },

    #[error("runtime bounds are inverted: min {min} > max {max}")]
    InvertedRuntimeBounds { min: f64, max: f64 },

    #[error("job is not COMPLETED (state {0})")]
    NotCompleted(crate::job::JobState),

    #[error("cannot read captured output {path}: {source}")]
    UnreadableOutput { path: PathBuf, source: io::Error },
}

impl PassCriteria {
    /// Check the criteria are well formed, compiling the regex if any
    fn compile(&self) -> Result<Option<Regex>, EvaluationError> {
        if let Some(RuntimeBounds {
            min: Some(min),
            max: Some(max),
        }) = self.runtime
        {
            if min > max {
                return Err(EvaluationError::InvertedRuntimeBounds { min, max });
            }
        }

        self.regex
            .as_ref()
            .map(|check| {
                Regex::new(&check.exp).map_err(|source| EvaluationError::InvalidRegex {
                    exp: check.exp.clone(),
                    source,
                })
            })
            .transpose()
    }

    fn has_checks(&self) -> bool {
        self.returncode.is_some() || self.regex.is_some() || self.runtime.is_some()
    }
}

/// Verdict for a COMPLETED job.
///
/// A job whose return code is unknown (`-1`) always fails.
pub fn evaluate(job: &Job, criteria: Option<&PassCriteria>) -> Result<Verdict, EvaluationError> {
    if job.state != crate::job::JobState::Completed {
        return Err(EvaluationError::NotCompleted(job.state));
    }

    let returncode = job.returncode.unwrap_or(UNKNOWN_RETURNCODE);
    let criteria = match criteria {
        Some(c) if c.has_checks() => c,
        Some(c) => {
            c.compile()?;
            return Ok(verdict(returncode == 0));
        }
        None => return Ok(verdict(returncode == 0)),
    };

    let regex = criteria.compile()?;
    if returncode == UNKNOWN_RETURNCODE {
        return Ok(Verdict::Fail);
    }

    let mut results = Vec::with_capacity(3);
    if let Some(expected) = &criteria.returncode {
        results.push(expected.matches(returncode));
    }
    if let (Some(check), Some(regex)) = (&criteria.regex, &regex) {
        let path = match check.stream {
            Stream::Stdout => &job.output_path,
            Stream::Stderr => &job.error_path,
        };
        // Binary output is matched on its lossy UTF-8 rendering
        let content = fs::read(path).map_err(|source| EvaluationError::UnreadableOutput {
            path: path.clone(),
            source,
        })?;
        results.push(regex.is_match(&String::from_utf8_lossy(&content)));
    }
    if let Some(bounds) = &criteria.runtime {
        results.push(match job.runtime() {
            Some(runtime) => {
                bounds.min.map_or(true, |min| runtime >= min)
                    && bounds.max.map_or(true, |max| runtime <= max)
            }
            None => false,
        });
    }

    let passed = match criteria.mode {
        CheckMode::All => results.iter().all(|ok| *ok),
        CheckMode::Any => results.iter().any(|ok| *ok),
    };
    Ok(verdict(passed))
}

fn verdict(passed: bool) -> Verdict {
    if passed {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}
