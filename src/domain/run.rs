//! Scenario runs and their status.
//!
//! A ScenarioRun is one attempt-group for one logical trigger of a scenario.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ActionError;

/// The tuple that maps to at most one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub scenario_id: String,
    pub trigger_key: String,
    pub correlation_id: String,
}

impl IdempotencyKey {
    pub fn new(
        scenario_id: impl Into<String>,
        trigger_key: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            trigger_key: trigger_key.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.scenario_id, self.trigger_key, self.correlation_id
        )
    }
}

/// One execution attempt-group for a scenario trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRun {
    /// Store-assigned identifier
    pub run_id: String,

    pub scenario_id: String,

    /// Step of a larger workflow this run belongs to
    pub node_id: Option<String>,

    pub correlation_id: String,

    /// External credential/connection used by the action
    pub connection_id: Option<String>,

    /// What caused this run ("manual", "webhook", ...)
    pub trigger_key: String,

    pub status: RunStatus,

    /// Attempts beyond the first
    pub retry_count: u32,

    /// Operation invocations made by the owning executor
    pub attempts: u32,

    pub duration_ms: Option<u64>,

    /// Output of the action on success, replayed for completed runs
    pub output: Option<serde_json::Value>,

    /// Terminal error on failure
    pub error: Option<ActionError>,

    pub is_fatal: bool,

    /// Whether a failure was escalated to the alert sink
    pub alert_triggered: bool,

    pub cancel_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl ScenarioRun {
    /// Create a pending run for an idempotency key
    pub fn new(run_id: String, key: &IdempotencyKey, connection_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            scenario_id: key.scenario_id.clone(),
            node_id: None,
            correlation_id: key.correlation_id.clone(),
            connection_id,
            trigger_key: key.trigger_key.clone(),
            status: RunStatus::Pending,
            retry_count: 0,
            attempts: 0,
            duration_ms: None,
            output: None,
            error: None,
            is_fatal: false,
            alert_triggered: false,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(&self.scenario_id, &self.trigger_key, &self.correlation_id)
    }

    /// Check if the run reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.status.is_completed()
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created by the idempotency guard, not yet executing
    #[default]
    Pending,

    /// Attempts in progress
    Running,

    /// Completed successfully
    Succeeded,

    /// Failed (fatal or retries exhausted)
    Failed,

    /// Cancelled cooperatively
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are sticky
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_completed(),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("Unknown run status: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_creation() {
        let key = IdempotencyKey::new("scn_1", "manual", "manual:scn_1:1:abc");
        let run = ScenarioRun::new("run_1".to_string(), &key, Some("conn_1".to_string()));

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.key(), key);
        assert_eq!(run.connection_id.as_deref(), Some("conn_1"));
        assert!(!run.is_finished());
    }

    #[test]
    fn test_terminal_statuses_are_sticky() {
        for terminal in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Cancelled] {
            assert!(terminal.is_completed());
            for next in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Succeeded,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_running_only_moves_to_terminal() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Succeeded));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        let status: RunStatus = "cancelled".parse().unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(status.to_string(), "cancelled");
        assert!("done".parse::<RunStatus>().is_err());
    }
}
