//! Layered configuration
//!
//! Layers, lowest precedence first:
//! 1. Built-in defaults
//! 2. Host config (~/.config/hpcrun/config.toml)
//! 3. Site config (`--config`)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::{
    BuiltinDefaults, DEFAULT_COMMAND_TIMEOUT_SECONDS, DEFAULT_MAX_POLL_ERRORS,
    DEFAULT_TERMINATION_GRACE_SECONDS,
};
pub use effective::{
    toml_to_json, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, Settings,
};
pub use merge::{deep_merge, merge_layers};
