//! Action executor.
//!
//! [`Engine`] ties the pieces together: the idempotency guard decides who
//! owns a run, the owner validates and executes the action through the retry
//! executor, and the lifecycle records the terminal status. Callers that do
//! not own the run get a replay of the finished run or `RUN_IN_PROGRESS`.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::actions::{ActionContext, ActionRegistry};
use crate::domain::{create_correlation_id, ActionError, ActionResult, ErrorCode, RunStatus};
use crate::store::{RunStore, StoreError};

use super::idempotency::{IdempotencyGuard, IdempotencyOutcome};
use super::lifecycle::{
    AlertSink, FailureOptions, RunCompletion, RunLifecycle, TracingAlertSink, TransitionOutcome,
};
use super::retry::{CancellationProbe, RetryConfig, RetryContext, RetryExecutor};

/// Everything needed to execute one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub scenario_id: String,

    #[serde(default)]
    pub node_id: Option<String>,

    pub action_type: String,

    #[serde(default = "empty_object")]
    pub config: Value,

    #[serde(default = "empty_object")]
    pub input: Value,

    #[serde(default = "default_trigger_key")]
    pub trigger_key: String,

    #[serde(default)]
    pub connection_id: Option<String>,

    /// Derived from trigger key and scenario when absent
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Engine default when absent
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,

    #[serde(default)]
    pub step: Option<u32>,
}

fn empty_object() -> Value {
    json!({})
}

fn default_trigger_key() -> String {
    "manual".to_string()
}

impl ExecutionOptions {
    pub fn new(scenario_id: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            node_id: None,
            action_type: action_type.into(),
            config: empty_object(),
            input: empty_object(),
            trigger_key: default_trigger_key(),
            connection_id: None,
            correlation_id: None,
            retry_config: None,
            step: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_trigger_key(mut self, trigger_key: impl Into<String>) -> Self {
        self.trigger_key = trigger_key.into();
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = Some(retry_config);
        self
    }

    pub fn with_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }
}

/// Optional fields applied by [`create_execution_options`]
#[derive(Debug, Clone, Default)]
pub struct ExecutionOverrides {
    pub node_id: Option<String>,
    pub config: Option<Value>,
    pub input: Option<Value>,
    pub trigger_key: Option<String>,
    pub connection_id: Option<String>,
    pub correlation_id: Option<String>,
    pub retry_config: Option<RetryConfig>,
    pub step: Option<u32>,
}

/// Options with trigger key "manual" and empty config and input, plus overrides
pub fn create_execution_options(
    scenario_id: impl Into<String>,
    action_type: impl Into<String>,
    overrides: Option<ExecutionOverrides>,
) -> ExecutionOptions {
    let mut options = ExecutionOptions::new(scenario_id, action_type);
    let Some(overrides) = overrides else {
        return options;
    };

    if let Some(config) = overrides.config {
        options.config = config;
    }
    if let Some(input) = overrides.input {
        options.input = input;
    }
    if let Some(trigger_key) = overrides.trigger_key {
        options.trigger_key = trigger_key;
    }
    options.node_id = overrides.node_id;
    options.connection_id = overrides.connection_id;
    options.correlation_id = overrides.correlation_id;
    options.retry_config = overrides.retry_config;
    options.step = overrides.step;
    options
}

/// What `execute_action` returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecutionResult {
    pub result: ActionResult<Value>,

    /// Empty when no run could be created
    pub run_id: String,

    pub is_new_run: bool,

    pub duration_ms: u64,

    /// Invocations made by this call; 0 for replays and observers
    pub attempts: u32,
}

impl ActionExecutionResult {
    /// Result for a failure before any run id was obtained
    pub(crate) fn without_run(error: ActionError, duration_ms: u64) -> Self {
        Self {
            result: ActionResult::FatalError { error },
            run_id: String::new(),
            is_new_run: false,
            duration_ms,
            attempts: 0,
        }
    }
}

/// Executes actions idempotently with retry
#[derive(Clone)]
pub struct Engine {
    registry: Arc<ActionRegistry>,
    store: Arc<dyn RunStore>,
    guard: IdempotencyGuard,
    lifecycle: RunLifecycle,
    retry: RetryExecutor,
    default_retry: RetryConfig,
}

impl Engine {
    pub fn new(registry: ActionRegistry, store: Arc<dyn RunStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            guard: IdempotencyGuard::new(store.clone()),
            lifecycle: RunLifecycle::new(store.clone(), Arc::new(TracingAlertSink)),
            retry: RetryExecutor::new(store.clone()),
            store,
            default_retry: RetryConfig::default(),
        }
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.lifecycle = RunLifecycle::new(self.store.clone(), alerts);
        self
    }

    /// Retry config used when the caller supplies none
    pub fn with_default_retry(mut self, config: RetryConfig) -> Self {
        self.default_retry = config;
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        self.store.clone()
    }

    pub fn lifecycle(&self) -> &RunLifecycle {
        &self.lifecycle
    }

    /// Execute an action at most once per idempotency key.
    ///
    /// Never returns `Err`: every failure, including engine faults, is folded
    /// into the returned result.
    #[instrument(skip(self, options), fields(scenario_id = %options.scenario_id, action_type = %options.action_type))]
    pub async fn execute_action(&self, options: ExecutionOptions) -> ActionExecutionResult {
        let started = Instant::now();
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| create_correlation_id(&options.trigger_key, &options.scenario_id));

        let idempotency = match self
            .guard
            .ensure_idempotent(
                &options.scenario_id,
                &options.trigger_key,
                &correlation_id,
                options.connection_id.clone(),
                options.node_id.clone(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => return ActionExecutionResult::without_run(error, elapsed_ms(started)),
        };

        if !idempotency.is_new {
            return self.observe_existing(&idempotency, started);
        }

        let run_id = idempotency.run_id;
        info!(run_id = %run_id, correlation_id = %correlation_id, "Created run");

        match self.execute_owned(&options, &run_id, &correlation_id).await {
            Ok((result, attempts)) => ActionExecutionResult {
                result,
                run_id,
                is_new_run: true,
                duration_ms: elapsed_ms(started),
                attempts,
            },
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Engine error during execution");
                let error = ActionError::new(
                    ErrorCode::ExecutionFailed,
                    format!("Engine error: {:#}", e),
                );

                let failure = self
                    .lifecycle
                    .mark_run_as_failed(
                        &run_id,
                        &options.scenario_id,
                        &error,
                        FailureOptions {
                            is_fatal: true,
                            trigger_alert: true,
                            duration_ms: Some(elapsed_ms(started)),
                            ..Default::default()
                        },
                    )
                    .await;
                let result = match failure {
                    Ok(TransitionOutcome::Rejected(run)) if run.status == RunStatus::Cancelled => {
                        cancelled_result(&run_id, run.cancel_reason.as_deref())
                    }
                    Ok(_) => ActionResult::FatalError { error },
                    Err(e) => {
                        error!(run_id = %run_id, error = %e, "Failed to record engine error on run");
                        ActionResult::FatalError { error }
                    }
                };

                ActionExecutionResult {
                    result,
                    run_id,
                    is_new_run: true,
                    duration_ms: elapsed_ms(started),
                    attempts: 0,
                }
            }
        }
    }

    /// Mark a run cancelled; a no-op for runs that already finished
    pub async fn cancel_execution(
        &self,
        run_id: &str,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, StoreError> {
        self.lifecycle.mark_run_as_cancelled(run_id, reason).await
    }

    /// Execute an action after `delay` on a background task
    pub fn schedule_action(
        &self,
        delay: Duration,
        options: ExecutionOptions,
    ) -> JoinHandle<ActionExecutionResult> {
        let engine = self.clone();
        debug!(
            scenario_id = %options.scenario_id,
            action_type = %options.action_type,
            delay_ms = delay.as_millis() as u64,
            "Scheduling action"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.execute_action(options).await
        })
    }

    /// Drive a run this caller owns; returns the terminal result and the
    /// number of invocations made
    async fn execute_owned(
        &self,
        options: &ExecutionOptions,
        run_id: &str,
        correlation_id: &str,
    ) -> Result<(ActionResult<Value>, u32)> {
        let started = Instant::now();

        match self.lifecycle.mark_run_as_running(run_id).await? {
            TransitionOutcome::Applied(_) => {}
            TransitionOutcome::Rejected(run) if run.status == RunStatus::Cancelled => {
                info!(run_id = %run_id, "Run cancelled before execution started");
                return Ok((cancelled_result(run_id, run.cancel_reason.as_deref()), 0));
            }
            TransitionOutcome::Rejected(run) => {
                bail!("Run {} cannot start from status {}", run_id, run.status)
            }
            TransitionOutcome::NotFound => bail!("Run {} disappeared before execution", run_id),
        }

        let Some(action) = self.registry.get(&options.action_type) else {
            let error = ActionError::new(
                ErrorCode::ExecutionFailed,
                format!("Unknown action type: {}", options.action_type),
            );
            let result = self.fail_before_execution(run_id, options, error, started).await?;
            return Ok((result, 0));
        };

        let retry_config = options
            .retry_config
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());

        let validation = retry_config
            .validate()
            .map_err(|e| ActionError::new(ErrorCode::ValidationFailed, format!("Invalid retry config: {}", e)))
            .and_then(|_| {
                action
                    .validate(&options.config, &options.input)
                    .map_err(ActionError::from)
            });
        if let Err(error) = validation {
            warn!(run_id = %run_id, error = %error, "Validation failed, not executing");
            let result = self.fail_before_execution(run_id, options, error, started).await?;
            return Ok((result, 0));
        }

        let probe = CancellationProbe::new(self.store.clone(), run_id);
        let retry_ctx = RetryContext::new(
            run_id,
            &options.scenario_id,
            format!("execute_action:{}", options.action_type),
            correlation_id,
        )
        .with_node(options.node_id.clone(), options.step)
        .with_input(options.input.clone())
        .with_cancellation(probe.clone());

        let base_ctx = ActionContext {
            run_id: run_id.to_string(),
            scenario_id: options.scenario_id.clone(),
            node_id: options.node_id.clone(),
            correlation_id: correlation_id.to_string(),
            connection_id: options.connection_id.clone(),
            trigger_key: options.trigger_key.clone(),
            step: options.step,
            attempt: 1,
            cancellation: Some(probe),
        };

        let outcome = self
            .retry
            .execute_with_retry(&retry_ctx, &retry_config, |attempt| {
                let action = action.clone();
                let input = options.input.clone();
                let config = options.config.clone();
                let mut ctx = base_ctx.clone();
                ctx.attempt = attempt;

                async move {
                    // Own task so a panicking action surfaces as a JoinError
                    let task =
                        tokio::spawn(async move { action.execute(&ctx, &input, &config).await });
                    match task.await {
                        Ok(result) => result,
                        Err(join_error) if join_error.is_panic() => Err(anyhow!(
                            "Action panicked: {}",
                            panic_message(join_error.into_panic())
                        )),
                        Err(join_error) => Err(anyhow!("Action task failed: {}", join_error)),
                    }
                }
            })
            .await;

        let transition = match &outcome.result {
            ActionResult::Success { data } => Some(
                self.lifecycle
                    .mark_run_as_succeeded(
                        run_id,
                        &options.scenario_id,
                        RunCompletion {
                            attempts: outcome.attempts,
                            duration_ms: outcome.duration_ms,
                            output: Some(data.clone()),
                        },
                    )
                    .await?,
            ),
            ActionResult::FatalError { error } if error.code == ErrorCode::ExecutionCancelled => {
                // Already terminal; nothing to record
                None
            }
            ActionResult::RetryableError { error } | ActionResult::FatalError { error } => {
                let is_fatal = outcome.result.is_fatal();
                Some(
                    self.lifecycle
                        .mark_run_as_failed(
                            run_id,
                            &options.scenario_id,
                            error,
                            FailureOptions {
                                is_fatal,
                                retry_count: outcome.attempts.saturating_sub(1),
                                trigger_alert: is_fatal
                                    && error.code != ErrorCode::MaxRetriesExceeded,
                                attempts: outcome.attempts,
                                duration_ms: Some(outcome.duration_ms),
                            },
                        )
                        .await?,
                )
            }
        };

        // The caller must see what the run record says
        match transition {
            None | Some(TransitionOutcome::Applied(_)) => {}
            Some(TransitionOutcome::Rejected(run)) if run.status == RunStatus::Cancelled => {
                info!(run_id = %run_id, attempts = outcome.attempts, "Run cancelled during its last attempt, discarding result");
                return Ok((
                    cancelled_result(run_id, run.cancel_reason.as_deref()),
                    outcome.attempts,
                ));
            }
            Some(TransitionOutcome::Rejected(run)) => {
                bail!("Run {} cannot complete from status {}", run_id, run.status)
            }
            Some(TransitionOutcome::NotFound) => {
                bail!("Run {} disappeared during execution", run_id)
            }
        }

        Ok((outcome.result, outcome.attempts))
    }

    /// Fail a run before any invocation; returns what the caller should see
    async fn fail_before_execution(
        &self,
        run_id: &str,
        options: &ExecutionOptions,
        error: ActionError,
        started: Instant,
    ) -> Result<ActionResult<Value>> {
        let transition = self
            .lifecycle
            .mark_run_as_failed(
                run_id,
                &options.scenario_id,
                &error,
                FailureOptions {
                    is_fatal: true,
                    trigger_alert: true,
                    duration_ms: Some(elapsed_ms(started)),
                    ..Default::default()
                },
            )
            .await?;

        match transition {
            TransitionOutcome::Rejected(run) if run.status == RunStatus::Cancelled => {
                Ok(cancelled_result(run_id, run.cancel_reason.as_deref()))
            }
            _ => Ok(ActionResult::FatalError { error }),
        }
    }

    /// Result for a caller that found an existing run
    fn observe_existing(
        &self,
        idempotency: &IdempotencyOutcome,
        started: Instant,
    ) -> ActionExecutionResult {
        let run = &idempotency.run;
        debug!(run_id = %run.run_id, status = %run.status, "Run already exists, not executing");

        let result = match run.status {
            RunStatus::Succeeded => ActionResult::success(run.output.clone().unwrap_or_else(|| {
                json!({
                    "runId": run.run_id,
                    "status": run.status.as_str(),
                    "replayed": true,
                })
            })),
            RunStatus::Failed => ActionResult::FatalError {
                error: run.error.clone().unwrap_or_else(|| {
                    ActionError::new(
                        ErrorCode::ExecutionFailed,
                        format!("Run {} previously failed", run.run_id),
                    )
                }),
            },
            RunStatus::Cancelled => cancelled_result(&run.run_id, run.cancel_reason.as_deref()),
            RunStatus::Pending | RunStatus::Running => ActionResult::retryable(
                ErrorCode::RunInProgress,
                format!("Run {} is {} under another caller", run.run_id, run.status),
            ),
        };

        ActionExecutionResult {
            result,
            run_id: run.run_id.clone(),
            is_new_run: false,
            duration_ms: elapsed_ms(started),
            attempts: 0,
        }
    }
}

fn cancelled_result(run_id: &str, reason: Option<&str>) -> ActionResult<Value> {
    let message = match reason {
        Some(reason) => format!("Run {} was cancelled: {}", run_id, reason),
        None => format!("Run {} was cancelled", run_id),
    };
    ActionResult::fatal(ErrorCode::ExecutionCancelled, message)
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
