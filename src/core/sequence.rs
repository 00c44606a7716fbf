//! Action sequences.
//!
//! A sequence runs actions in order under one shared correlation id; step
//! `i` (1-based) uses `"{shared}:step_{i}"`. Sequences can also be declared
//! in YAML:
//!
//! ```yaml
//! name: onboarding
//! scenario_id: scn_onboarding
//! trigger_key: webhook
//! stop_on_error: true
//! retry: fast
//! steps:
//!   - action_type: data_transform
//!     config: { transform_type: add_timestamp }
//!     input: { user: alice }
//!   - action_type: logger
//!     node_id: announce
//!     config: { message: "user onboarded" }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::domain::{create_correlation_id, step_correlation_id, ActionError, ErrorCode};

use super::executor::{panic_message, ActionExecutionResult, Engine, ExecutionOptions};
use super::retry::{RetryConfig, RetryPreset};

/// Options for `execute_action_sequence`
#[derive(Debug, Clone)]
pub struct SequenceOptions {
    /// Stop at the first step whose result is not a success
    pub stop_on_error: bool,

    /// Derived from the first action's trigger key and scenario when absent
    pub shared_correlation_id: Option<String>,

    /// Applied to steps without their own retry config
    pub retry_config: Option<RetryConfig>,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            shared_correlation_id: None,
            retry_config: None,
        }
    }
}

impl Engine {
    /// Execute actions in order.
    ///
    /// The returned vector has one entry per attempted action; with
    /// `stop_on_error` the actions after the first failure are neither
    /// attempted nor given runs.
    #[instrument(skip(self, actions, options), fields(steps = actions.len()))]
    pub async fn execute_action_sequence(
        &self,
        actions: Vec<ExecutionOptions>,
        options: SequenceOptions,
    ) -> Vec<ActionExecutionResult> {
        let Some(first) = actions.first() else {
            return Vec::new();
        };
        let shared = options
            .shared_correlation_id
            .clone()
            .unwrap_or_else(|| create_correlation_id(&first.trigger_key, &first.scenario_id));

        let total = actions.len();
        let mut results = Vec::with_capacity(total);

        for (index, mut action) in actions.into_iter().enumerate() {
            let step = index as u32 + 1;
            action.correlation_id = Some(step_correlation_id(&shared, step));
            action.step = Some(step);
            if action.retry_config.is_none() {
                action.retry_config = options.retry_config.clone();
            }

            let engine = self.clone();
            let result = match tokio::spawn(async move { engine.execute_action(action).await }).await {
                Ok(result) => result,
                Err(join_error) => {
                    let reason = if join_error.is_panic() {
                        panic_message(join_error.into_panic())
                    } else {
                        join_error.to_string()
                    };
                    warn!(step, reason = %reason, "Sequence step aborted before producing a run");
                    ActionExecutionResult::without_run(
                        ActionError::new(
                            ErrorCode::ExecutionFailed,
                            format!("Step {} aborted: {}", step, reason),
                        ),
                        0,
                    )
                }
            };

            let failed = !result.result.is_success();
            results.push(result);

            if failed && options.stop_on_error {
                info!(step, total, "Stopping sequence after failed step");
                break;
            }
        }

        results
    }
}

/// Errors in a sequence definition
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("Failed to read sequence file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse sequence YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Sequence name cannot be empty")]
    EmptyName,

    #[error("Sequence must have at least one step")]
    NoSteps,

    #[error("Step {0} has an empty action_type")]
    EmptyActionType(usize),

    #[error("Duplicate node_id '{0}'")]
    DuplicateNodeId(String),
}

/// Retry setting in YAML: a preset name or a literal config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetrySetting {
    Preset(String),
    Config(RetryConfig),
}

impl RetrySetting {
    pub fn resolve(&self) -> RetryConfig {
        match self {
            Self::Preset(name) => RetryPreset::from_name(name).config(),
            Self::Config(config) => config.clone(),
        }
    }
}

/// A sequence declared in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Defaults to the sequence name
    #[serde(default)]
    pub scenario_id: Option<String>,

    #[serde(default = "default_trigger_key")]
    pub trigger_key: String,

    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,

    #[serde(default)]
    pub retry: Option<RetrySetting>,

    pub steps: Vec<SequenceStep>,
}

fn default_trigger_key() -> String {
    "manual".to_string()
}

fn default_stop_on_error() -> bool {
    true
}

/// One step of a sequence definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub action_type: String,

    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default)]
    pub connection_id: Option<String>,

    #[serde(default)]
    pub config: Option<Value>,

    #[serde(default)]
    pub input: Option<Value>,

    /// Overrides the sequence-level retry setting
    #[serde(default)]
    pub retry: Option<RetrySetting>,
}

impl SequenceDefinition {
    /// Load a sequence from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, SequenceError> {
        let content = std::fs::read_to_string(path).map_err(|source| SequenceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, SequenceError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.name.trim().is_empty() {
            return Err(SequenceError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(SequenceError::NoSteps);
        }

        let mut node_ids = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.action_type.trim().is_empty() {
                return Err(SequenceError::EmptyActionType(i + 1));
            }
            if let Some(node_id) = &step.node_id {
                if !node_ids.insert(node_id.as_str()) {
                    return Err(SequenceError::DuplicateNodeId(node_id.clone()));
                }
            }
        }

        Ok(())
    }

    pub fn scenario_id(&self) -> &str {
        self.scenario_id.as_deref().unwrap_or(&self.name)
    }

    /// Execution options per step plus sequence options
    pub fn into_options(
        self,
        shared_correlation_id: Option<String>,
    ) -> (Vec<ExecutionOptions>, SequenceOptions) {
        let scenario_id = self.scenario_id().to_string();

        let actions = self
            .steps
            .into_iter()
            .map(|step| {
                let mut options = ExecutionOptions::new(&scenario_id, step.action_type)
                    .with_trigger_key(&self.trigger_key);
                options.node_id = step.node_id;
                options.connection_id = step.connection_id;
                if let Some(config) = step.config {
                    options.config = config;
                }
                if let Some(input) = step.input {
                    options.input = input;
                }
                options.retry_config = step.retry.as_ref().map(RetrySetting::resolve);
                options
            })
            .collect();

        let sequence = SequenceOptions {
            stop_on_error: self.stop_on_error,
            shared_correlation_id,
            retry_config: self.retry.as_ref().map(RetrySetting::resolve),
        };

        (actions, sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SEQUENCE_YAML: &str = r#"
name: onboarding
description: Onboard a user
trigger_key: webhook
retry: fast
steps:
  - action_type: data_transform
    config:
      transform_type: add_timestamp
    input:
      user: alice
  - action_type: logger
    node_id: announce
    retry:
      max_attempts: 1
      initial_delay_ms: 0
      max_delay_ms: 0
"#;

    #[test]
    fn test_sequence_parsing() {
        let sequence = SequenceDefinition::from_yaml(TEST_SEQUENCE_YAML).unwrap();
        assert_eq!(sequence.name, "onboarding");
        assert_eq!(sequence.scenario_id(), "onboarding");
        assert!(sequence.stop_on_error);
        assert_eq!(sequence.steps.len(), 2);
        assert!(sequence.validate().is_ok());
    }

    #[test]
    fn test_into_options_resolves_retry() {
        let sequence = SequenceDefinition::from_yaml(TEST_SEQUENCE_YAML).unwrap();
        let (actions, options) = sequence.into_options(Some("shared".to_string()));

        assert_eq!(options.retry_config, Some(RetryPreset::Fast.config()));
        assert_eq!(options.shared_correlation_id.as_deref(), Some("shared"));
        assert_eq!(actions[0].trigger_key, "webhook");
        assert_eq!(actions[0].retry_config, None);
        assert_eq!(actions[1].retry_config.as_ref().map(|c| c.max_attempts), Some(1));
        assert_eq!(actions[1].node_id.as_deref(), Some("announce"));
    }

    #[test]
    fn test_validation_errors() {
        let no_steps = SequenceDefinition::from_yaml("name: empty\nsteps: []").unwrap();
        assert!(matches!(no_steps.validate(), Err(SequenceError::NoSteps)));

        let duplicate = SequenceDefinition::from_yaml(
            r#"
name: dup
steps:
  - action_type: logger
    node_id: a
  - action_type: logger
    node_id: a
"#,
        )
        .unwrap();
        assert!(matches!(
            duplicate.validate(),
            Err(SequenceError::DuplicateNodeId(id)) if id == "a"
        ));

        let blank = SequenceDefinition::from_yaml("name: blank\nsteps:\n  - action_type: ''").unwrap();
        assert!(matches!(blank.validate(), Err(SequenceError::EmptyActionType(1))));
    }
}
