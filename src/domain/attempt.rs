//! Attempt log entries.
//!
//! One entry is appended per operation invocation of a retry loop, plus one
//! terminal entry when retries are exhausted or the run is cancelled. Entries
//! are never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::ActionError;
use super::result::{ActionResult, ResultKind};

/// A single row in the append-only attempt log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLogEntry {
    /// Unique identifier for this entry
    pub id: Uuid,

    pub run_id: String,

    pub node_id: Option<String>,

    /// 1-based attempt number; terminal entries repeat the last attempt
    pub attempt: u32,

    /// Operation name, e.g. "execute_action:http_request"
    pub operation: String,

    pub correlation_id: String,

    pub step: Option<u32>,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,

    pub status: AttemptStatus,

    pub error: Option<ActionError>,

    /// First 16 hex chars of the SHA-256 of the serialized input
    pub input_digest: Option<String>,

    pub input: Option<serde_json::Value>,

    pub output: Option<serde_json::Value>,
}

impl AttemptLogEntry {
    /// Create an entry for an attempt that started at `started_at`
    pub fn new(
        run_id: impl Into<String>,
        operation: impl Into<String>,
        correlation_id: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        status: AttemptStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: run_id.into(),
            node_id: None,
            attempt,
            operation: operation.into(),
            correlation_id: correlation_id.into(),
            step: None,
            started_at,
            duration_ms: 0,
            status,
            error: None,
            input_digest: None,
            input: None,
            output: None,
        }
    }

    pub fn with_node(mut self, node_id: Option<String>, step: Option<u32>) -> Self {
        self.node_id = node_id;
        self.step = step;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: ActionError) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach an input snapshot and its digest
    pub fn with_input(mut self, input: Option<serde_json::Value>) -> Self {
        self.input_digest = input.as_ref().map(input_digest);
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: Option<serde_json::Value>) -> Self {
        self.output = output;
        self
    }

    /// Whether this entry records an operation invocation (not a terminal marker)
    pub fn is_invocation(&self) -> bool {
        !matches!(self.status, AttemptStatus::Exhausted | AttemptStatus::Cancelled)
    }
}

/// Outcome recorded for an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    RetryableError,
    FatalError,

    /// Terminal marker: retries ran out
    Exhausted,

    /// Terminal marker: the run was cancelled between attempts
    Cancelled,
}

impl AttemptStatus {
    pub fn of<T>(result: &ActionResult<T>) -> Self {
        match result.kind() {
            ResultKind::Success => Self::Success,
            ResultKind::RetryableError => Self::RetryableError,
            ResultKind::FatalError => Self::FatalError,
        }
    }
}

/// Digest of a serialized input (first 16 hex chars of SHA-256)
pub fn input_digest(input: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.to_string().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
