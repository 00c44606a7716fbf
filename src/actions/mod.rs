//! Actions and the action registry.
//!
//! An action is one unit of external work (log a message, call an HTTP
//! endpoint, reshape data). Actions are written against typed config, input
//! and output; the registry stores them type-erased behind [`ErasedAction`]
//! so the engine can dispatch on the action type string.

pub mod http;
pub mod logger;
pub mod transform;
pub mod webhook;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::retry::CancellationProbe;
use crate::domain::{ActionError, ActionResult, ErrorCode};

pub use http::HttpRequestAction;
pub use logger::LoggerAction;
pub use transform::DataTransformAction;
pub use webhook::WebhookSendAction;

/// Which part of an invocation failed to match the action's schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPart {
    Config,
    Input,
    Output,
}

impl fmt::Display for SchemaPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Config => "config",
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

/// Config, input or output that does not fit an action's schema
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Invalid {part} for action '{action_type}': {message}")]
pub struct SchemaViolation {
    pub action_type: String,
    pub part: SchemaPart,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(action_type: impl Into<String>, part: SchemaPart, message: impl fmt::Display) -> Self {
        Self {
            action_type: action_type.into(),
            part,
            message: message.to_string(),
        }
    }
}

impl From<SchemaViolation> for ActionError {
    fn from(violation: SchemaViolation) -> Self {
        ActionError::new(ErrorCode::ValidationFailed, violation.to_string())
    }
}

/// Everything an action knows about the invocation it is part of
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub run_id: String,
    pub scenario_id: String,
    pub node_id: Option<String>,
    pub correlation_id: String,
    pub connection_id: Option<String>,
    pub trigger_key: String,

    /// Position within a sequence, if any
    pub step: Option<u32>,

    /// 1-based attempt number
    pub attempt: u32,

    pub cancellation: Option<CancellationProbe>,
}

impl ActionContext {
    pub fn new(
        run_id: impl Into<String>,
        scenario_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            scenario_id: scenario_id.into(),
            node_id: None,
            correlation_id: correlation_id.into(),
            connection_id: None,
            trigger_key: "manual".to_string(),
            step: None,
            attempt: 1,
            cancellation: None,
        }
    }

    /// Poll whether the run has been cancelled.
    ///
    /// Long-running actions can check this to stop early; the engine also
    /// checks it between attempts.
    pub async fn is_cancelled(&self) -> bool {
        match &self.cancellation {
            Some(probe) => probe.is_cancelled().await,
            None => false,
        }
    }
}

/// A typed action
#[async_trait]
pub trait Action: Send + Sync + 'static {
    type Config: DeserializeOwned + Send + Sync;
    type Input: DeserializeOwned + Send + Sync;
    type Output: Serialize + Send;

    /// Registry key, e.g. "http_request"
    fn action_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Checks beyond what deserialization enforces
    fn validate_config(&self, _config: &Self::Config) -> Result<(), SchemaViolation> {
        Ok(())
    }

    fn validate_output(&self, _output: &Self::Output) -> Result<(), SchemaViolation> {
        Ok(())
    }

    /// Run the action once.
    ///
    /// `Err` means the action failed without classifying the failure; the
    /// engine retries it as `UNKNOWN_ERROR`.
    async fn execute(
        &self,
        ctx: &ActionContext,
        input: Self::Input,
        config: Self::Config,
    ) -> Result<ActionResult<Self::Output>>;
}

/// An action operating on JSON values, as stored in the registry
#[async_trait]
pub trait ErasedAction: Send + Sync {
    fn action_type(&self) -> &str;

    fn description(&self) -> &str;

    /// Check config and input against the action's schema without executing
    fn validate(&self, config: &Value, input: &Value) -> Result<(), SchemaViolation>;

    async fn execute(
        &self,
        ctx: &ActionContext,
        input: &Value,
        config: &Value,
    ) -> Result<ActionResult<Value>>;
}

/// Adapts a typed [`Action`] to [`ErasedAction`]
pub struct TypedAction<A>(pub A);

impl<A: Action> TypedAction<A> {
    fn parse_config(&self, config: &Value) -> Result<A::Config, SchemaViolation> {
        let parsed: A::Config = serde_json::from_value(config.clone())
            .map_err(|e| SchemaViolation::new(self.0.action_type(), SchemaPart::Config, e))?;
        self.0.validate_config(&parsed)?;
        Ok(parsed)
    }

    fn parse_input(&self, input: &Value) -> Result<A::Input, SchemaViolation> {
        serde_json::from_value(input.clone())
            .map_err(|e| SchemaViolation::new(self.0.action_type(), SchemaPart::Input, e))
    }

    fn encode_output(&self, output: A::Output) -> Result<Value, SchemaViolation> {
        self.0.validate_output(&output)?;
        serde_json::to_value(output)
            .map_err(|e| SchemaViolation::new(self.0.action_type(), SchemaPart::Output, e))
    }
}

#[async_trait]
impl<A: Action> ErasedAction for TypedAction<A> {
    fn action_type(&self) -> &str {
        self.0.action_type()
    }

    fn description(&self) -> &str {
        self.0.description()
    }

    fn validate(&self, config: &Value, input: &Value) -> Result<(), SchemaViolation> {
        self.parse_config(config)?;
        self.parse_input(input)?;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ActionContext,
        input: &Value,
        config: &Value,
    ) -> Result<ActionResult<Value>> {
        let parsed = self
            .parse_config(config)
            .and_then(|config| self.parse_input(input).map(|input| (config, input)));
        let (config, input) = match parsed {
            Ok(parsed) => parsed,
            Err(violation) => return Ok(ActionResult::FatalError { error: violation.into() }),
        };

        let result = self.0.execute(ctx, input, config).await?;
        Ok(result.and_then(|output| self.encode_output(output).map_err(ActionError::from)))
    }
}

/// Registry entry summary for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub action_type: String,
    pub description: String,
}

/// Maps action type strings to actions.
///
/// Built once at startup and handed to the engine; tests build their own.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn ErasedAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with `logger`, `data_transform`, `http_request` and
    /// `webhook_send`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(LoggerAction);
        registry.register(DataTransformAction);
        registry.register(HttpRequestAction::default());
        registry.register(WebhookSendAction::default());
        registry
    }

    /// Register a typed action, replacing any action with the same type
    pub fn register<A: Action>(&mut self, action: A) -> &mut Self {
        self.register_erased(Arc::new(TypedAction(action)))
    }

    pub fn register_erased(&mut self, action: Arc<dyn ErasedAction>) -> &mut Self {
        self.actions.insert(action.action_type().to_string(), action);
        self
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ErasedAction>> {
        self.actions.get(action_type).cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Registered actions sorted by type
    pub fn descriptors(&self) -> Vec<ActionDescriptor> {
        let mut descriptors: Vec<ActionDescriptor> = self
            .actions
            .values()
            .map(|action| ActionDescriptor {
                action_type: action.action_type().to_string(),
                description: action.description().to_string(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.action_type.cmp(&b.action_type));
        descriptors
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.actions.keys().collect();
        types.sort();
        f.debug_struct("ActionRegistry").field("actions", &types).finish()
    }
}
