//! stepwise - Idempotent action execution engine
//!
//! Executes externally-defined actions at most once per logical trigger,
//! retrying transient failures with exponential backoff and recording every
//! attempt durably.
//!
//! # Architecture
//!
//! - A run is keyed by `(scenario_id, trigger_key, correlation_id)`; the
//!   idempotency guard creates or finds it atomically
//! - The caller that created the run executes the action through the retry
//!   executor; every other caller replays the finished run
//! - Runs move through `pending -> running -> succeeded | failed | cancelled`;
//!   terminal statuses are sticky
//! - Cancellation is cooperative and observed between attempts
//!
//! # Modules
//!
//! - `actions`: The action trait, registry and built-in actions
//! - `core`: Retry, idempotency, lifecycle, executor and sequences
//! - `domain`: Data structures (ActionResult, ScenarioRun, AttemptLogEntry)
//! - `store`: Run stores (in-memory and SQLite)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Execute an action
//! stepwise run logger --input '{"user": "alice"}'
//!
//! # Replay it (same correlation id, no second execution)
//! stepwise run logger --correlation-id manual:cli:1700000000000:abc123xyz
//!
//! # Inspect a run and its attempts
//! stepwise status <run-id>
//! stepwise attempts <run-id>
//! ```

pub mod actions;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use actions::{Action, ActionContext, ActionRegistry};
pub use core::{
    create_execution_options, ActionExecutionResult, Engine, ExecutionOptions, ExecutionOverrides,
    RetryConfig, RetryPreset, SequenceOptions,
};
pub use domain::{
    create_correlation_id, parse_correlation_id, ActionError, ActionResult, ErrorCode, RunStatus,
    ScenarioRun,
};
pub use store::{MemoryRunStore, RunStore, SqliteRunStore};
