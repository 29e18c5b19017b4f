//! Executor registry
//!
//! Every executor is named `<category>/<name>` and configured under
//! `[executors.<category>.<name>]`. Settings are layered:
//!
//! 1. built-in poll defaults
//! 2. `[executors.defaults]` (every executor)
//! 3. `[executors.<category>.defaults]` (one backend family)
//! 4. `[executors.<category>.<name>]` (the instance)
//! 5. command-line overrides
//!
//! `defaults` is therefore a reserved instance name. Loading validates every
//! entry; after that the registry is read-only.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use hpcrun_dialect::BatchDialect;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::deep_merge;
use crate::timeout::{PollConfig, TimeoutValidationError};

/// Reserved table name for layered defaults
pub const DEFAULTS_KEY: &str = "defaults";

/// Backend family of an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorCategory {
    Local,
    Slurm,
    Lsf,
    Pbs,
    Torque,
    Container,
}

impl ExecutorCategory {
    pub const ALL: [ExecutorCategory; 6] = [
        ExecutorCategory::Local,
        ExecutorCategory::Slurm,
        ExecutorCategory::Lsf,
        ExecutorCategory::Pbs,
        ExecutorCategory::Torque,
        ExecutorCategory::Container,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorCategory::Local => "local",
            ExecutorCategory::Slurm => "slurm",
            ExecutorCategory::Lsf => "lsf",
            ExecutorCategory::Pbs => "pbs",
            ExecutorCategory::Torque => "torque",
            ExecutorCategory::Container => "container",
        }
    }

    /// Scheduler vocabulary for batch categories
    pub fn dialect(&self) -> Option<BatchDialect> {
        match self {
            ExecutorCategory::Slurm => Some(BatchDialect::Slurm),
            ExecutorCategory::Lsf => Some(BatchDialect::Lsf),
            ExecutorCategory::Pbs => Some(BatchDialect::Pbs),
            ExecutorCategory::Torque => Some(BatchDialect::Torque),
            ExecutorCategory::Local | ExecutorCategory::Container => None,
        }
    }

    /// Batch jobs complete asynchronously and are polled
    pub fn is_async(&self) -> bool {
        self.dialect().is_some()
    }
}

impl fmt::Display for ExecutorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorCategory {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutorCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| RegistryError::UnknownCategory(s.to_string()))
    }
}

/// Container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
    Singularity,
    Apptainer,
}

impl ContainerRuntime {
    pub fn program(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Singularity => "singularity",
            ContainerRuntime::Apptainer => "apptainer",
        }
    }

    /// docker and podman name containers and can stop them by name
    pub fn supports_names(&self) -> bool {
        matches!(self, ContainerRuntime::Docker | ContainerRuntime::Podman)
    }
}

/// A fully resolved executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub category: ExecutorCategory,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Shell that runs the test script
    pub shell: String,

    /// Queue (LSF, PBS, Torque) or partition (Slurm)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    /// Quality of service (Slurm)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<String>,

    /// Extra submit options (batch) or runtime options (container)
    pub options: Vec<String>,

    pub poll_interval_seconds: u64,
    pub max_pending_seconds: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ContainerRuntime>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Bind mounts, `host:container`
    pub mounts: Vec<String>,
}

impl ExecutorConfig {
    /// `<category>/<name>`
    pub fn reference(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            poll_interval_seconds: self.poll_interval_seconds,
            max_pending_seconds: self.max_pending_seconds,
        }
    }

    pub fn is_async(&self) -> bool {
        self.category.is_async()
    }
}

/// Raw instance table after layering
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecutorFields {
    description: Option<String>,
    shell: Option<String>,
    #[serde(alias = "partition")]
    queue: Option<String>,
    account: Option<String>,
    qos: Option<String>,
    #[serde(default)]
    options: Vec<String>,
    poll_interval_seconds: Option<u64>,
    max_pending_seconds: Option<u64>,
    runtime: Option<ContainerRuntime>,
    image: Option<String>,
    #[serde(default)]
    mounts: Vec<String>,
}

/// Highest-precedence poll settings, applied to every executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorOverrides {
    pub poll_interval_seconds: Option<u64>,
    pub max_pending_seconds: Option<u64>,
}

impl ExecutorOverrides {
    fn to_value(self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(poll) = self.poll_interval_seconds {
            map.insert("poll_interval_seconds".to_string(), poll.into());
        }
        if let Some(pending) = self.max_pending_seconds {
            map.insert("max_pending_seconds".to_string(), pending.into());
        }
        Value::Object(map)
    }
}

/// Errors that can occur when loading or resolving executors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown executor '{reference}' (known: {})", .known.join(", "))]
    UnknownExecutor {
        reference: String,
        known: Vec<String>,
    },

    #[error("unknown executor category '{0}' (expected local, slurm, lsf, pbs, torque or container)")]
    UnknownCategory(String),

    #[error("executor '{reference}': {reason}")]
    InvalidValue { reference: String, reason: String },

    #[error("executor '{reference}': {source}")]
    Parse {
        reference: String,
        source: serde_json::Error,
    },

    #[error("executor '{reference}': {source}")]
    Poll {
        reference: String,
        source: TimeoutValidationError,
    },
}

/// Read-only set of configured executors
#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, ExecutorConfig>,
}

impl ExecutorRegistry {
    /// Load every executor from the merged `[executors]` table.
    pub fn from_value(executors: &Value, overrides: ExecutorOverrides) -> Result<Self, RegistryError> {
        let empty = serde_json::Map::new();
        let table = match executors {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(RegistryError::InvalidValue {
                    reference: "executors".to_string(),
                    reason: "expected a table".to_string(),
                })
            }
        };

        let global = table.get(DEFAULTS_KEY).cloned().unwrap_or(Value::Null);
        let mut registry = Self::default();

        for (category_key, instances) in table {
            if category_key == DEFAULTS_KEY {
                continue;
            }
            let category: ExecutorCategory = category_key.parse()?;
            let instances = instances.as_object().ok_or_else(|| RegistryError::InvalidValue {
                reference: category_key.clone(),
                reason: "expected a table of executors".to_string(),
            })?;

            let family = instances.get(DEFAULTS_KEY).cloned().unwrap_or(Value::Null);

            for (name, instance) in instances {
                if name == DEFAULTS_KEY {
                    continue;
                }
                let reference = format!("{}/{}", category, name);
                if !instance.is_object() {
                    return Err(RegistryError::InvalidValue {
                        reference,
                        reason: "expected a table".to_string(),
                    });
                }

                let mut layered = Value::Object(serde_json::Map::new());
                for layer in [&global, &family, instance] {
                    if layer.is_object() {
                        layered = deep_merge(layered, layer.clone());
                    }
                }
                layered = deep_merge(layered, overrides.to_value());

                let config = Self::build_executor(category, name, layered)?;
                registry.executors.insert(reference, config);
            }
        }

        Ok(registry)
    }

    fn build_executor(
        category: ExecutorCategory,
        name: &str,
        layered: Value,
    ) -> Result<ExecutorConfig, RegistryError> {
        let reference = format!("{}/{}", category, name);
        let invalid = |reason: &str| RegistryError::InvalidValue {
            reference: reference.clone(),
            reason: reason.to_string(),
        };

        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(invalid(
                "name must contain only alphanumeric characters, dots, dashes, and underscores",
            ));
        }

        let fields: ExecutorFields =
            serde_json::from_value(layered).map_err(|source| RegistryError::Parse {
                reference: reference.clone(),
                source,
            })?;

        let poll = PollConfig {
            poll_interval_seconds: fields
                .poll_interval_seconds
                .unwrap_or(PollConfig::default().poll_interval_seconds),
            max_pending_seconds: fields
                .max_pending_seconds
                .unwrap_or(PollConfig::default().max_pending_seconds),
        };
        poll.validate().map_err(|source| RegistryError::Poll {
            reference: reference.clone(),
            source,
        })?;

        let is_container = category == ExecutorCategory::Container;
        if is_container && fields.image.as_deref().map_or(true, str::is_empty) {
            return Err(invalid("container executors require an 'image'"));
        }
        if !is_container && (fields.image.is_some() || fields.runtime.is_some()) {
            return Err(invalid("only container executors accept 'image' and 'runtime'"));
        }
        if !is_container && !fields.mounts.is_empty() {
            return Err(invalid("only container executors accept 'mounts'"));
        }

        let shell = fields.shell.unwrap_or_else(|| {
            if is_container { "sh" } else { "bash" }.to_string()
        });
        if shell.trim().is_empty() || shell.contains(char::is_whitespace) {
            return Err(invalid("shell must be a single program name or path"));
        }

        Ok(ExecutorConfig {
            category,
            name: name.to_string(),
            description: fields.description,
            shell,
            queue: fields.queue,
            account: fields.account,
            qos: fields.qos,
            options: fields.options,
            poll_interval_seconds: poll.poll_interval_seconds,
            max_pending_seconds: poll.max_pending_seconds,
            runtime: if is_container {
                Some(fields.runtime.unwrap_or(ContainerRuntime::Docker))
            } else {
                None
            },
            image: fields.image,
            mounts: fields.mounts,
        })
    }

    /// Resolve `<category>/<name>`
    pub fn resolve(&self, reference: &str) -> Result<&ExecutorConfig, RegistryError> {
        self.executors
            .get(reference)
            .ok_or_else(|| RegistryError::UnknownExecutor {
                reference: reference.to_string(),
                known: self.references(),
            })
    }

    /// Executors sorted by reference
    pub fn list(&self) -> Vec<&ExecutorConfig> {
        self.executors.values().collect()
    }

    pub fn references(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
