//! The tagged result shape every action returns.

use serde::{Deserialize, Serialize};

use super::error::{ActionError, ErrorCode};

/// Outcome of one action invocation.
///
/// Exactly one variant is set, and both error variants always carry an
/// [`ActionError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionResult<T> {
    /// The action completed and produced data
    Success { data: T },

    /// The action failed but may succeed if attempted again
    RetryableError { error: ActionError },

    /// The action failed and must not be attempted again
    FatalError { error: ActionError },
}

/// Discriminant of an [`ActionResult`] without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Success,
    RetryableError,
    FatalError,
}

impl<T> ActionResult<T> {
    pub fn success(data: T) -> Self {
        Self::Success { data }
    }

    pub fn retryable(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self::RetryableError {
            error: ActionError::new(code, message),
        }
    }

    pub fn fatal(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self::FatalError {
            error: ActionError::new(code, message),
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            Self::Success { .. } => ResultKind::Success,
            Self::RetryableError { .. } => ResultKind::RetryableError,
            Self::FatalError { .. } => ResultKind::FatalError,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalError { .. })
    }

    /// The error carried by either error variant
    pub fn error(&self) -> Option<&ActionError> {
        match self {
            Self::Success { .. } => None,
            Self::RetryableError { error } | Self::FatalError { error } => Some(error),
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success { data } => Some(data),
            _ => None,
        }
    }

    /// Transform the success payload, leaving errors untouched
    pub fn map<U, F>(self, f: F) -> ActionResult<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Success { data } => ActionResult::Success { data: f(data) },
            Self::RetryableError { error } => ActionResult::RetryableError { error },
            Self::FatalError { error } => ActionResult::FatalError { error },
        }
    }

    /// Transform the success payload with a fallible function.
    ///
    /// A failing transform turns the result into a `FatalError`.
    pub fn and_then<U, F>(self, f: F) -> ActionResult<U>
    where
        F: FnOnce(T) -> Result<U, ActionError>,
    {
        match self {
            Self::Success { data } => match f(data) {
                Ok(data) => ActionResult::Success { data },
                Err(error) => ActionResult::FatalError { error },
            },
            Self::RetryableError { error } => ActionResult::RetryableError { error },
            Self::FatalError { error } => ActionResult::FatalError { error },
        }
    }
}
