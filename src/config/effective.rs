//! Effective configuration with provenance
//!
//! The effective configuration is the merged value of every layer plus a
//! record of which files contributed and their SHA-256 digests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;

/// Upper bound for `termination_grace_seconds`
pub const MAX_TERMINATION_GRACE_SECONDS: u64 = 300;

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Site,
    Cli,
}

/// One layer that went into the merge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the file as read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ConfigSource {
    fn inline(origin: ConfigOrigin) -> Self {
        Self {
            origin,
            path: None,
            digest: None,
        }
    }

    fn file(origin: ConfigOrigin, path: &Path, bytes: &[u8]) -> Self {
        Self {
            origin,
            path: Some(path.display().to_string()),
            digest: Some(hex::encode(Sha256::digest(bytes))),
        }
    }
}

/// Typed top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Store root
    pub root: PathBuf,
    pub pool_size: usize,
    pub max_poll_errors: u32,
    pub termination_grace_seconds: u64,
    /// Deadline for each scheduler or runtime command
    pub command_timeout_seconds: u64,
}

impl Settings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "pool_size must be a positive integer".to_string(),
            ));
        }
        if self.termination_grace_seconds > MAX_TERMINATION_GRACE_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "termination_grace_seconds must be in [0, {}], got {}",
                MAX_TERMINATION_GRACE_SECONDS, self.termination_grace_seconds
            )));
        }
        if self.command_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_seconds must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Merged configuration and where it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub created_at: DateTime<Utc>,

    pub config: Value,

    /// Lowest precedence first
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// `~/.config/hpcrun/config.toml`
    pub fn default_host_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".config/hpcrun/config.toml"))
    }

    /// Merge built-in defaults, the host file, the site file and CLI
    /// overrides.
    ///
    /// A missing host file is skipped. A missing site file is an error.
    pub fn build(
        host_config_path: Option<&Path>,
        site_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource::inline(ConfigOrigin::Builtin)];

        let host = host_config_path.filter(|path| path.exists());
        if let Some(path) = site_config_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
        }
        let files = [(ConfigOrigin::Host, host), (ConfigOrigin::Site, site_config_path)];
        for (origin, path) in files {
            let Some(path) = path else { continue };
            let bytes = fs::read(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            layers.push(parse_toml(path, &bytes)?);
            sources.push(ConfigSource::file(origin, path, &bytes));
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource::inline(ConfigOrigin::Cli));
        }

        let config = Self {
            created_at: Utc::now(),
            config: merge_layers(layers),
            sources,
        };
        if !config.executors().is_object() {
            return Err(ConfigError::Invalid("executors must be a table".to_string()));
        }
        config.settings()?;
        Ok(config)
    }

    /// Typed view of the top-level settings
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let settings: Settings = serde_json::from_value(self.config.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// The merged `[executors]` table
    pub fn executors(&self) -> Value {
        self.config
            .get("executors")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Value at a dotted path, e.g. `executors.local.sh.shell`
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.config, |value, key| value.get(key))
    }
}

fn parse_toml(path: &Path, bytes: &[u8]) -> Result<Value, ConfigError> {
    let contents = std::str::from_utf8(bytes).map_err(|e| ConfigError::Invalid(format!(
        "{}: not UTF-8: {}",
        path.display(),
        e
    )))?;
    let value: toml::Value = toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml_to_json(value))
}

/// Convert a TOML value to a JSON value
pub fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
