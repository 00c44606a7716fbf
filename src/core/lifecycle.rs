//! Run lifecycle state machine.
//!
//! ```text
//! pending ──► running ──► succeeded
//!    │           ├──────► failed
//!    └───────────┴──────► cancelled
//! ```
//!
//! Every transition is a single atomic read-modify-write through the store.
//! Terminal statuses are sticky: a transition out of one is rejected without
//! writing, which makes cancel on a finished run a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::domain::{ActionError, RunStatus, ScenarioRun};
use crate::store::{RunStore, RunUpdate, StoreError};

/// True for succeeded, failed and cancelled
pub fn is_run_completed(status: RunStatus) -> bool {
    status.is_completed()
}

/// Escalation raised for failures that need human attention
#[derive(Debug, Clone)]
pub struct RunAlert {
    pub run_id: String,
    pub scenario_id: String,
    pub error: ActionError,
    pub retry_count: u32,
}

/// Receives alerts for fatal run failures
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: &RunAlert);
}

/// Default sink: emits the alert as an `error!` event
#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: &RunAlert) {
        error!(
            run_id = %alert.run_id,
            scenario_id = %alert.scenario_id,
            code = %alert.error.code,
            retry_count = alert.retry_count,
            "ALERT: run failed and needs attention: {}",
            alert.error.message
        );
    }
}

/// Metadata recorded with a successful run
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub attempts: u32,
    pub duration_ms: u64,
    pub output: Option<serde_json::Value>,
}

/// Options for `mark_run_as_failed`
#[derive(Debug, Clone, Default)]
pub struct FailureOptions {
    pub is_fatal: bool,
    pub retry_count: u32,
    pub trigger_alert: bool,

    /// Invocations made before failing (0 if the action never ran)
    pub attempts: u32,

    pub duration_ms: Option<u64>,
}

/// What a transition request did
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The run moved to the requested status
    Applied(ScenarioRun),

    /// The current status does not allow the transition; nothing was written
    Rejected(ScenarioRun),

    NotFound,
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn run(&self) -> Option<&ScenarioRun> {
        match self {
            Self::Applied(run) | Self::Rejected(run) => Some(run),
            Self::NotFound => None,
        }
    }

    fn from_update(update: RunUpdate) -> Self {
        match update {
            RunUpdate::Updated(run) => Self::Applied(run),
            RunUpdate::Unchanged(run) => Self::Rejected(run),
            RunUpdate::NotFound => Self::NotFound,
        }
    }
}

/// Owns every status transition of a run
#[derive(Clone)]
pub struct RunLifecycle {
    store: Arc<dyn RunStore>,
    alerts: Arc<dyn AlertSink>,
}

impl RunLifecycle {
    pub fn new(store: Arc<dyn RunStore>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { store, alerts }
    }

    /// pending -> running
    pub async fn mark_run_as_running(&self, run_id: &str) -> Result<TransitionOutcome, StoreError> {
        let update = self
            .store
            .update_run(
                run_id,
                Box::new(|run| {
                    if !run.status.can_transition_to(RunStatus::Running) {
                        return false;
                    }
                    run.status = RunStatus::Running;
                    true
                }),
            )
            .await?;

        let outcome = TransitionOutcome::from_update(update);
        self.log_outcome(run_id, RunStatus::Running, &outcome);
        Ok(outcome)
    }

    /// -> succeeded, recording attempts, duration and output
    pub async fn mark_run_as_succeeded(
        &self,
        run_id: &str,
        scenario_id: &str,
        completion: RunCompletion,
    ) -> Result<TransitionOutcome, StoreError> {
        let RunCompletion {
            attempts,
            duration_ms,
            output,
        } = completion;
        let update = self
            .store
            .update_run(
                run_id,
                Box::new(move |run| {
                    if !run.status.can_transition_to(RunStatus::Succeeded) {
                        return false;
                    }
                    run.status = RunStatus::Succeeded;
                    run.attempts = attempts;
                    run.retry_count = attempts.saturating_sub(1);
                    run.duration_ms = Some(duration_ms);
                    run.output = output;
                    run.completed_at = Some(Utc::now());
                    true
                }),
            )
            .await?;

        let outcome = TransitionOutcome::from_update(update);
        if outcome.is_applied() {
            info!(
                run_id = %run_id,
                scenario_id = %scenario_id,
                attempts,
                duration_ms,
                "Run succeeded"
            );
        } else {
            self.log_outcome(run_id, RunStatus::Succeeded, &outcome);
        }
        Ok(outcome)
    }

    /// -> failed; raises an alert when `trigger_alert` is set and the
    /// transition was applied
    pub async fn mark_run_as_failed(
        &self,
        run_id: &str,
        scenario_id: &str,
        error: &ActionError,
        options: FailureOptions,
    ) -> Result<TransitionOutcome, StoreError> {
        let recorded_error = error.clone();
        let recorded = options.clone();
        let update = self
            .store
            .update_run(
                run_id,
                Box::new(move |run| {
                    if !run.status.can_transition_to(RunStatus::Failed) {
                        return false;
                    }
                    run.status = RunStatus::Failed;
                    run.error = Some(recorded_error);
                    run.is_fatal = recorded.is_fatal;
                    run.retry_count = recorded.retry_count;
                    run.attempts = recorded.attempts;
                    run.duration_ms = recorded.duration_ms;
                    run.alert_triggered = recorded.trigger_alert;
                    run.completed_at = Some(Utc::now());
                    true
                }),
            )
            .await?;

        let outcome = TransitionOutcome::from_update(update);
        if !outcome.is_applied() {
            self.log_outcome(run_id, RunStatus::Failed, &outcome);
            return Ok(outcome);
        }

        warn!(
            run_id = %run_id,
            scenario_id = %scenario_id,
            is_fatal = options.is_fatal,
            retry_count = options.retry_count,
            error = %error,
            "Run failed"
        );

        if options.trigger_alert {
            self.alerts
                .raise(&RunAlert {
                    run_id: run_id.to_string(),
                    scenario_id: scenario_id.to_string(),
                    error: error.clone(),
                    retry_count: options.retry_count,
                })
                .await;
        }

        Ok(outcome)
    }

    /// -> cancelled. Cooperative: in-flight attempts finish and the retry
    /// loop stops at its next status check.
    pub async fn mark_run_as_cancelled(
        &self,
        run_id: &str,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, StoreError> {
        let recorded_reason = reason.clone();
        let update = self
            .store
            .update_run(
                run_id,
                Box::new(move |run| {
                    if !run.status.can_transition_to(RunStatus::Cancelled) {
                        return false;
                    }
                    run.status = RunStatus::Cancelled;
                    run.cancel_reason = recorded_reason;
                    run.completed_at = Some(Utc::now());
                    true
                }),
            )
            .await?;

        let outcome = TransitionOutcome::from_update(update);
        if outcome.is_applied() {
            info!(run_id = %run_id, reason = ?reason, "Run cancelled");
        } else {
            self.log_outcome(run_id, RunStatus::Cancelled, &outcome);
        }
        Ok(outcome)
    }

    fn log_outcome(&self, run_id: &str, target: RunStatus, outcome: &TransitionOutcome) {
        match outcome {
            TransitionOutcome::Applied(_) => {
                debug!(run_id = %run_id, status = %target, "Run transitioned");
            }
            TransitionOutcome::Rejected(run) => {
                debug!(
                    run_id = %run_id,
                    current = %run.status,
                    requested = %target,
                    "Transition not permitted, ignoring"
                );
            }
            TransitionOutcome::NotFound => {
                warn!(run_id = %run_id, requested = %target, "Transition requested for unknown run");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorCode, IdempotencyKey};
    use crate::store::{MemoryRunStore, NewRun};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<RunAlert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn raise(&self, alert: &RunAlert) {
            self.alerts.lock().unwrap().push(alert.clone());
        }
    }

    async fn setup() -> (RunLifecycle, Arc<MemoryRunStore>, Arc<RecordingSink>, String) {
        let store = Arc::new(MemoryRunStore::new());
        let sink = Arc::new(RecordingSink::default());
        let created = store
            .create_or_find_run(NewRun {
                key: IdempotencyKey::new("scn_1", "manual", "c1"),
                node_id: None,
                connection_id: None,
            })
            .await
            .unwrap();
        let lifecycle = RunLifecycle::new(store.clone(), sink.clone());
        (lifecycle, store, sink, created.run.run_id)
    }

    #[test]
    fn test_is_run_completed() {
        assert!(!is_run_completed(RunStatus::Pending));
        assert!(!is_run_completed(RunStatus::Running));
        assert!(is_run_completed(RunStatus::Succeeded));
        assert!(is_run_completed(RunStatus::Failed));
        assert!(is_run_completed(RunStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_success_path_records_metadata() {
        let (lifecycle, store, _sink, run_id) = setup().await;

        assert!(lifecycle.mark_run_as_running(&run_id).await.unwrap().is_applied());
        let outcome = lifecycle
            .mark_run_as_succeeded(
                &run_id,
                "scn_1",
                RunCompletion {
                    attempts: 2,
                    duration_ms: 40,
                    output: Some(serde_json::json!({"ok": true})),
                },
            )
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.attempts, 2);
        assert_eq!(run.retry_count, 1);
        assert_eq!(run.output, Some(serde_json::json!({"ok": true})));
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_on_completed_run_is_noop() {
        let (lifecycle, store, _sink, run_id) = setup().await;
        lifecycle.mark_run_as_running(&run_id).await.unwrap();
        lifecycle
            .mark_run_as_succeeded(&run_id, "scn_1", RunCompletion::default())
            .await
            .unwrap();

        let outcome = lifecycle
            .mark_run_as_cancelled(&run_id, Some("too late".to_string()))
            .await
            .unwrap();

        assert!(matches!(outcome, TransitionOutcome::Rejected(_)));
        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.cancel_reason, None);
    }

    #[tokio::test]
    async fn test_fatal_failure_raises_alert_once() {
        let (lifecycle, store, sink, run_id) = setup().await;
        lifecycle.mark_run_as_running(&run_id).await.unwrap();
        let error = ActionError::new(ErrorCode::ValidationFailed, "missing url");
        let options = FailureOptions {
            is_fatal: true,
            trigger_alert: true,
            attempts: 1,
            ..Default::default()
        };

        lifecycle
            .mark_run_as_failed(&run_id, "scn_1", &error, options.clone())
            .await
            .unwrap();
        let second = lifecycle
            .mark_run_as_failed(&run_id, "scn_1", &error, options)
            .await
            .unwrap();

        assert!(!second.is_applied());
        assert_eq!(sink.alerts.lock().unwrap().len(), 1);

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.is_fatal);
        assert!(run.alert_triggered);
        assert_eq!(run.error, Some(error));
    }

    #[tokio::test]
    async fn test_exhausted_failure_does_not_alert() {
        let (lifecycle, _store, sink, run_id) = setup().await;
        lifecycle.mark_run_as_running(&run_id).await.unwrap();

        lifecycle
            .mark_run_as_failed(
                &run_id,
                "scn_1",
                &ActionError::new(ErrorCode::MaxRetriesExceeded, "gave up"),
                FailureOptions {
                    retry_count: 2,
                    attempts: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(sink.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let (lifecycle, _store, _sink, _run_id) = setup().await;
        let outcome = lifecycle.mark_run_as_cancelled("missing", None).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::NotFound));
    }
}
