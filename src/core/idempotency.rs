//! Idempotency guard.
//!
//! A run is identified by `(scenario_id, trigger_key, correlation_id)`. The
//! guard asks the store to atomically create a pending run for that key or
//! return the one that already exists, so concurrent callers with the same
//! key observe exactly one new run between them.

use std::sync::Arc;

use tracing::{debug, error, instrument};

use crate::domain::{ActionError, ErrorCode, IdempotencyKey, RunStatus, ScenarioRun};
use crate::store::{NewRun, RunStore};

/// What the guard found (or created) for a key
#[derive(Debug, Clone)]
pub struct IdempotencyOutcome {
    /// True for exactly one caller per key
    pub is_new: bool,

    pub run_id: String,

    /// Status of the pre-existing run; `None` when this call created it
    pub existing_status: Option<RunStatus>,

    /// The run record as read inside the atomic create-or-find
    pub run: ScenarioRun,
}

impl IdempotencyOutcome {
    /// True when a previous caller already drove the run to a terminal status
    pub fn is_completed(&self) -> bool {
        self.existing_status
            .map(|status| status.is_completed())
            .unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn RunStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Create a run for the key or find the existing one.
    ///
    /// Store failures are reported as `IDEMPOTENCY_CONFLICT`.
    #[instrument(skip(self, connection_id, node_id))]
    pub async fn ensure_idempotent(
        &self,
        scenario_id: &str,
        trigger_key: &str,
        correlation_id: &str,
        connection_id: Option<String>,
        node_id: Option<String>,
    ) -> Result<IdempotencyOutcome, ActionError> {
        let key = IdempotencyKey::new(scenario_id, trigger_key, correlation_id);

        let found = self
            .store
            .create_or_find_run(NewRun {
                key: key.clone(),
                node_id,
                connection_id,
            })
            .await
            .map_err(|e| {
                error!(key = %key, error = %e, "Idempotency check failed");
                ActionError::new(
                    ErrorCode::IdempotencyConflict,
                    format!("Failed to create or find run for {}: {}", key, e),
                )
            })?;

        let outcome = IdempotencyOutcome {
            is_new: found.created,
            run_id: found.run.run_id.clone(),
            existing_status: if found.created {
                None
            } else {
                Some(found.run.status)
            },
            run: found.run,
        };

        debug!(
            run_id = %outcome.run_id,
            is_new = outcome.is_new,
            existing_status = ?outcome.existing_status,
            "Idempotency check complete"
        );

        Ok(outcome)
    }
}
