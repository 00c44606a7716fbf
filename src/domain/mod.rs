//! Domain types for the stepwise engine.
//!
//! This module contains the core data structures:
//! - Errors: codes, structured errors and folded error context
//! - ActionResult: the success / retryable / fatal union
//! - Run: scenario runs and their lifecycle status
//! - Attempt: append-only attempt log entries
//! - Correlation: correlation id creation and parsing

pub mod attempt;
pub mod correlation;
pub mod error;
pub mod result;
pub mod run;

// Re-export commonly used types
pub use attempt::{input_digest, AttemptLogEntry, AttemptStatus};
pub use correlation::{
    create_correlation_id, create_correlation_id_with_extra, parse_correlation_id,
    step_correlation_id, CorrelationIdError, ParsedCorrelationId,
};
pub use error::{ActionError, ErrorCode, ErrorContext};
pub use result::{ActionResult, ResultKind};
pub use run::{IdempotencyKey, RunStatus, ScenarioRun};
