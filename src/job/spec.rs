//! Resolved test specifications
//!
//! A test arrives fully resolved: a name, the command to run, the executor
//! reference, and optional pass criteria and resource requests. Tests are
//! read from a TOML file of `[[test]]` tables.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::evaluate::PassCriteria;

/// One resolved test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Test name (also the file stem of its scripts)
    pub name: String,

    /// Executor reference, e.g. `local/bash` or `slurm/debug`
    pub executor: String,

    /// Shell command(s) making up the test body
    pub command: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Environment exported before the command runs
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Declared pass criteria (default: returncode 0)
    #[serde(default)]
    pub status: Option<PassCriteria>,

    #[serde(default)]
    pub resources: Resources,
}

/// Resources requested from a batch scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub nodes: Option<u32>,
    pub procs: Option<u32>,
    pub time_limit_minutes: Option<u32>,
    /// Extra scheduler options, copied verbatim into directives
    #[serde(default)]
    pub options: Vec<String>,
}

impl TestSpec {
    /// Minimal test with default criteria and no resources.
    pub fn new(name: &str, executor: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            executor: executor.to_string(),
            command: command.to_string(),
            tags: Vec::new(),
            env: BTreeMap::new(),
            status: None,
            resources: Resources::default(),
        }
    }

    fn validate(&self) -> Result<(), TestFileError> {
        if self.name.is_empty() {
            return Err(TestFileError::InvalidValue {
                name: "(unnamed)".to_string(),
                field: "name".to_string(),
                reason: "name cannot be empty".to_string(),
            });
        }

        // Names become file and directory names
        if !self
            .name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
            || self.name.starts_with('.')
        {
            return Err(TestFileError::InvalidValue {
                name: self.name.clone(),
                field: "name".to_string(),
                reason: "name must contain only alphanumeric characters, dots, dashes, and underscores".to_string(),
            });
        }

        if self.executor.is_empty() {
            return Err(TestFileError::InvalidValue {
                name: self.name.clone(),
                field: "executor".to_string(),
                reason: "executor cannot be empty".to_string(),
            });
        }

        for key in self.env.keys() {
            let valid = key
                .chars()
                .next()
                .map(|c| c.is_ascii_alphabetic() || c == '_')
                .unwrap_or(false)
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(TestFileError::InvalidValue {
                    name: self.name.clone(),
                    field: "env".to_string(),
                    reason: format!("'{}' is not a valid environment variable name", key),
                });
            }
        }

        Ok(())
    }
}

/// A file of resolved tests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestFile {
    #[serde(default, rename = "test")]
    pub tests: Vec<TestSpec>,
}

/// Errors that can occur when loading a test file
#[derive(Debug, thiserror::Error)]
pub enum TestFileError {
    #[error("Failed to read test file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate test name: '{0}'")]
    DuplicateName(String),

    #[error("Test '{name}': invalid value for '{field}': {reason}")]
    InvalidValue {
        name: String,
        field: String,
        reason: String,
    },

    #[error("No tests defined")]
    Empty,
}

impl TestFile {
    pub fn load(path: &Path) -> Result<Self, TestFileError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, TestFileError> {
        let file: TestFile = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), TestFileError> {
        if self.tests.is_empty() {
            return Err(TestFileError::Empty);
        }

        let mut seen = HashSet::new();
        for test in &self.tests {
            if !seen.insert(&test.name) {
                return Err(TestFileError::DuplicateName(test.name.clone()));
            }
            test.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::{CheckMode, ReturnCodeMatch, Stream};

    #[test]
    fn test_parse_full_test() {
        let content = r#"
            [[test]]
            name = "hello"
            executor = "local/bash"
            command = "echo hello"
            tags = ["smoke"]
            env = { GREETING = "hi" }

            [test.status]
            returncode = [0, 2]
            regex = { stream = "stdout", exp = "hello" }
            runtime = { min = 0.0, max = 60.0 }
            mode = "all"

            [test.resources]
            nodes = 1
            procs = 4
            time_limit_minutes = 10
            options = ["--exclusive"]
        "#;

        let file = TestFile::parse(content).unwrap();
        assert_eq!(file.tests.len(), 1);

        let test = &file.tests[0];
        assert_eq!(test.name, "hello");
        assert_eq!(test.executor, "local/bash");
        assert_eq!(test.tags, vec!["smoke"]);
        assert_eq!(test.env.get("GREETING").map(String::as_str), Some("hi"));
        assert_eq!(test.resources.procs, Some(4));
        assert_eq!(test.resources.options, vec!["--exclusive"]);

        let status = test.status.as_ref().unwrap();
        assert_eq!(status.returncode, Some(ReturnCodeMatch::AnyOf(vec![0, 2])));
        assert_eq!(status.regex.as_ref().unwrap().stream, Stream::Stdout);
        assert_eq!(status.mode, CheckMode::All);
    }

    #[test]
    fn test_minimal_test_defaults() {
        let content = r#"
            [[test]]
            name = "t"
            executor = "local/sh"
            command = "true"
        "#;

        let test = &TestFile::parse(content).unwrap().tests[0];
        assert!(test.tags.is_empty());
        assert!(test.env.is_empty());
        assert!(test.status.is_none());
        assert_eq!(test.resources, Resources::default());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let content = r#"
            [[test]]
            name = "same"
            executor = "local/sh"
            command = "true"

            [[test]]
            name = "same"
            executor = "local/bash"
            command = "false"
        "#;

        let result = TestFile::parse(content);
        assert!(matches!(result, Err(TestFileError::DuplicateName(_))));
    }

    #[test]
    fn test_path_like_name_rejected() {
        let content = r#"
            [[test]]
            name = "../escape"
            executor = "local/sh"
            command = "true"
        "#;

        let result = TestFile::parse(content);
        assert!(matches!(result, Err(TestFileError::InvalidValue { .. })));
    }

    #[test]
    fn test_bad_env_key_rejected() {
        let content = r#"
            [[test]]
            name = "t"
            executor = "local/sh"
            command = "true"
            env = { "1BAD" = "x" }
        "#;

        let result = TestFile::parse(content);
        assert!(matches!(result, Err(TestFileError::InvalidValue { .. })));
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(matches!(TestFile::parse(""), Err(TestFileError::Empty)));
    }
}
