//! Per-container configuration.
//!
//! Every field has a default, so an empty TOML document (or
//! `ContainerConfig::default()`) is a valid configuration.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ACTION_QUEUE_DEFAULT_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Capacity of the pre-sized action queue.
    pub action_queue_max_length: usize,
    /// Compare states deeply (serialized JSON) instead of by reference.
    pub protect_state: bool,
    /// Re-registering an existing container id keeps the existing container.
    pub keep_state: bool,
    pub managed_attributes: ManagedAttributes,
    pub debug: DebugConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            action_queue_max_length: ACTION_QUEUE_DEFAULT_SIZE,
            protect_state: true,
            keep_state: false,
            managed_attributes: ManagedAttributes::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl ContainerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse container config")
    }

    pub fn with_queue_max_length(mut self, len: usize) -> Self {
        self.action_queue_max_length = len;
        self
    }

    pub fn with_protect_state(mut self, protect: bool) -> Self {
        self.protect_state = protect;
        self
    }

    pub fn with_keep_state(mut self, keep: bool) -> Self {
        self.keep_state = keep;
        self
    }

    pub fn with_async_operation_flag(mut self, attribute: impl Into<String>) -> Self {
        self.managed_attributes.async_operation_flag = Some(attribute.into());
        self
    }

    pub fn with_debug(mut self, debug: DebugConfig) -> Self {
        self.debug = debug;
        self
    }

    /// The action is not listed in `debug.non_tracked_actions`.
    pub(crate) fn tracks_action(&self, name: &str) -> bool {
        !self.debug.non_tracked_actions.contains(name)
    }
}

/// Attributes whose value the container manages on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagedAttributes {
    /// Boolean attribute raised while an `async` action's reducer runs.
    pub async_operation_flag: Option<String>,
}

/// Switches for diagnostic events, all emitted at `debug` level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    pub dispatching: DispatchingDebug,
    pub registration: RegistrationDebug,
    /// Action names that never produce per-action diagnostics.
    pub non_tracked_actions: HashSet<String>,
    /// Log action, previous state, next state and changed paths per reducer run.
    pub reducer: bool,
    /// Emit warnings for misuse that is otherwise silent.
    pub warnings: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchingDebug {
    pub active: bool,
    pub listeners: bool,
    pub queue: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrationDebug {
    pub container: RegistrationSwitches,
    pub listeners: RegistrationSwitches,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrationSwitches {
    pub registering: bool,
    pub unregistering: bool,
}

/// Load and parse a TOML container config file.
pub fn load_config(path: &Path) -> Result<ContainerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: ContainerConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ContainerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ContainerConfig::default());
        assert_eq!(config.action_queue_max_length, 1000);
        assert!(config.protect_state);
        assert!(!config.keep_state);
    }

    #[test]
    fn nested_sections_parse() {
        let config = ContainerConfig::from_toml_str(
            r#"
            action_queue_max_length = 16
            protect_state = false

            [managed_attributes]
            async_operation_flag = "busy"

            [debug]
            warnings = true
            non_tracked_actions = ["mouse-moved"]

            [debug.dispatching]
            active = true
            queue = true
            "#,
        )
        .unwrap();

        assert_eq!(config.action_queue_max_length, 16);
        assert!(!config.protect_state);
        assert_eq!(config.managed_attributes.async_operation_flag.as_deref(), Some("busy"));
        assert!(config.debug.warnings);
        assert!(config.debug.dispatching.queue);
        assert!(!config.tracks_action("mouse-moved"));
        assert!(config.tracks_action("add"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ContainerConfig::from_toml_str("queue_size = 3").is_err());
    }
}
