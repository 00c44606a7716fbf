//! Core execution logic.
//!
//! This module contains:
//! - Retry: backoff configuration, presets and the retry loop
//! - Idempotency: the guard that creates or finds runs atomically
//! - Lifecycle: run status transitions and alerting
//! - Executor: the engine behind `execute_action`
//! - Sequence: ordered execution and YAML sequence definitions

pub mod executor;
pub mod idempotency;
pub mod lifecycle;
pub mod retry;
pub mod sequence;

// Re-export commonly used types
pub use executor::{
    create_execution_options, ActionExecutionResult, Engine, ExecutionOptions, ExecutionOverrides,
};
pub use idempotency::{IdempotencyGuard, IdempotencyOutcome};
pub use lifecycle::{
    is_run_completed, AlertSink, FailureOptions, RunAlert, RunCompletion, RunLifecycle,
    TracingAlertSink, TransitionOutcome,
};
pub use retry::{
    CancellationProbe, RetryConfig, RetryConfigError, RetryContext, RetryExecutor, RetryOutcome,
    RetryPreset,
};
pub use sequence::{RetrySetting, SequenceDefinition, SequenceError, SequenceOptions, SequenceStep};
