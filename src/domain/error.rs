//! Error taxonomy shared by actions and the engine.
//!
//! Every failure carries a `{code, message}` pair. Codes are a closed set of
//! engine codes plus an open `Other` variant for codes introduced by actions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// The idempotency guard could not atomically create or find a run
    IdempotencyConflict,

    /// The action could not be executed (unknown type, engine fault)
    ExecutionFailed,

    /// Retryable failures exhausted the configured attempts
    MaxRetriesExceeded,

    /// An action returned an error without classifying it
    UnknownError,

    /// Config, input or output did not match the action's schema
    ValidationFailed,

    /// An external service could not be reached
    ExternalServiceError,

    /// The run was cancelled while attempts were outstanding
    ExecutionCancelled,

    /// Another caller owns this run and it has not finished yet
    RunInProgress,

    /// Action-specific code
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::ExecutionCancelled => "EXECUTION_CANCELLED",
            Self::RunInProgress => "RUN_IN_PROGRESS",
            Self::Other(code) => code,
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "IDEMPOTENCY_CONFLICT" => Self::IdempotencyConflict,
            "EXECUTION_FAILED" => Self::ExecutionFailed,
            "MAX_RETRIES_EXCEEDED" => Self::MaxRetriesExceeded,
            "UNKNOWN_ERROR" => Self::UnknownError,
            "VALIDATION_FAILED" => Self::ValidationFailed,
            "EXTERNAL_SERVICE_ERROR" => Self::ExternalServiceError,
            "EXECUTION_CANCELLED" => Self::ExecutionCancelled,
            "RUN_IN_PROGRESS" => Self::RunInProgress,
            _ => Self::Other(code),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        Self::from(code.to_string())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error reported by an action or synthesized by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub code: ErrorCode,
    pub message: String,
}

impl ActionError {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ActionError {}

/// Errors folded across retry attempts.
///
/// Keeps only the most recent error and a count so that a log line can say
/// "failed 3 times, last error X" without carrying every attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub count: u32,
    pub last: Option<ActionError>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold another error into the context
    pub fn record(&mut self, error: &ActionError) {
        self.count += 1;
        self.last = Some(error.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// One-line summary suitable for a terminal error message
    pub fn summary(&self) -> String {
        match &self.last {
            Some(last) => format!(
                "failed {} time{}, last error {}",
                self.count,
                if self.count == 1 { "" } else { "s" },
                last
            ),
            None => "no errors recorded".to_string(),
        }
    }
}
