//! Retry with exponential backoff.
//!
//! [`RetryExecutor::execute_with_retry`] drives a fallible operation until it
//! succeeds, fails fatally, or runs out of attempts. Every invocation is
//! appended to the attempt log before the next one starts.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::{
    ActionError, ActionResult, AttemptLogEntry, AttemptStatus, ErrorCode, ErrorContext, RunStatus,
};
use crate::store::RunStore;

/// Retry configuration for an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound on the deterministic part of the delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= factor after each retry)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Random delay in `[0, jitter_ms]` added on top of the backoff
    #[serde(default)]
    pub jitter_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryPreset::Standard.config()
    }
}

/// A `RetryConfig` that violates its invariants
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryConfigError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,

    #[error("max_delay_ms ({max}) must be >= initial_delay_ms ({initial})")]
    MaxBelowInitial { initial: u64, max: u64 },

    #[error("backoff_factor must be a finite number >= 1, got {0}")]
    InvalidBackoffFactor(f64),
}

impl RetryConfig {
    pub fn preset(preset: RetryPreset) -> Self {
        preset.config()
    }

    /// A config that retries immediately, without any delay
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
            jitter_ms: None,
        }
    }

    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.max_attempts < 1 {
            return Err(RetryConfigError::NoAttempts);
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(RetryConfigError::MaxBelowInitial {
                initial: self.initial_delay_ms,
                max: self.max_delay_ms,
            });
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(RetryConfigError::InvalidBackoffFactor(self.backoff_factor));
        }
        Ok(())
    }

    /// Deterministic delay after a failed attempt (1-indexed), without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.initial_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Backoff plus uniformly random jitter; never below `backoff_delay`
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.backoff_delay(attempt);
        match self.jitter_ms {
            Some(jitter) if jitter > 0 => base + Duration::from_millis(rng.gen_range(0..=jitter)),
            _ => base,
        }
    }
}

/// Named retry presets for different classes of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    /// Cheap in-process work
    Fast,

    #[default]
    Standard,

    /// Long-running or heavily rate limited work
    Slow,

    /// Calls to third-party services
    External,
}

impl RetryPreset {
    /// Resolve a preset name; unrecognized names fall back to `Standard`
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "fast" => Self::Fast,
            "slow" => Self::Slow,
            "external" => Self::External,
            _ => Self::Standard,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Slow => "slow",
            Self::External => "external",
        }
    }

    pub fn config(&self) -> RetryConfig {
        match self {
            Self::Fast => RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                backoff_factor: 2.0,
                jitter_ms: Some(50),
            },
            Self::Standard => RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1_000,
                max_delay_ms: 10_000,
                backoff_factor: 2.0,
                jitter_ms: Some(250),
            },
            Self::Slow => RetryConfig {
                max_attempts: 5,
                initial_delay_ms: 5_000,
                max_delay_ms: 60_000,
                backoff_factor: 2.0,
                jitter_ms: Some(1_000),
            },
            Self::External => RetryConfig {
                max_attempts: 5,
                initial_delay_ms: 2_000,
                max_delay_ms: 30_000,
                backoff_factor: 2.0,
                jitter_ms: Some(500),
            },
        }
    }
}

impl fmt::Display for RetryPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reads a run's status so a retry loop (or an action) can stop early.
///
/// Cancellation is cooperative: nothing is aborted, callers poll.
#[derive(Clone)]
pub struct CancellationProbe {
    store: Arc<dyn RunStore>,
    run_id: String,
}

impl CancellationProbe {
    pub fn new(store: Arc<dyn RunStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// True once the run has been marked cancelled
    pub async fn is_cancelled(&self) -> bool {
        match self.store.get_run(&self.run_id).await {
            Ok(Some(run)) => run.status == RunStatus::Cancelled,
            Ok(None) => false,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Failed to read run status for cancellation check");
                false
            }
        }
    }
}

impl fmt::Debug for CancellationProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationProbe")
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Identifies the operation being retried, for the attempt log
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub run_id: String,
    pub scenario_id: String,
    pub node_id: Option<String>,
    pub step: Option<u32>,

    /// e.g. "execute_action:http_request"
    pub operation: String,

    pub correlation_id: String,

    /// Input snapshot recorded with each attempt
    pub input: Option<serde_json::Value>,

    pub cancellation: Option<CancellationProbe>,
}

impl RetryContext {
    pub fn new(
        run_id: impl Into<String>,
        scenario_id: impl Into<String>,
        operation: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            scenario_id: scenario_id.into(),
            node_id: None,
            step: None,
            operation: operation.into(),
            correlation_id: correlation_id.into(),
            input: None,
            cancellation: None,
        }
    }

    pub fn with_node(mut self, node_id: Option<String>, step: Option<u32>) -> Self {
        self.node_id = node_id;
        self.step = step;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_cancellation(mut self, probe: CancellationProbe) -> Self {
        self.cancellation = Some(probe);
        self
    }

    fn entry(&self, attempt: u32, started_at: chrono::DateTime<Utc>, status: AttemptStatus) -> AttemptLogEntry {
        AttemptLogEntry::new(
            self.run_id.clone(),
            self.operation.clone(),
            self.correlation_id.clone(),
            attempt,
            started_at,
            status,
        )
        .with_node(self.node_id.clone(), self.step)
        .with_input(self.input.clone())
    }
}

/// Final outcome of a retry loop
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: ActionResult<T>,

    /// Operation invocations actually made
    pub attempts: u32,

    pub duration_ms: u64,

    /// Retryable errors seen along the way
    pub errors: ErrorContext,
}

/// Runs operations with retry and records every attempt
#[derive(Clone)]
pub struct RetryExecutor {
    store: Arc<dyn RunStore>,
}

impl RetryExecutor {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Retry `operation` according to `config`.
    ///
    /// The operation receives the 1-based attempt number. An `Err` from the
    /// operation is treated as `retryable_error{UNKNOWN_ERROR}`; operations
    /// that want such failures to be fatal must return `FatalError` instead.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        ctx: &RetryContext,
        config: &RetryConfig,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        T: Serialize,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<ActionResult<T>>>,
    {
        let started = Instant::now();
        let max_attempts = config.max_attempts.max(1);
        let mut errors = ErrorContext::new();
        let mut attempt = 1u32;

        loop {
            if let Some(probe) = &ctx.cancellation {
                if probe.is_cancelled().await {
                    return self.cancelled(ctx, attempt - 1, started, errors).await;
                }
            }

            let attempt_started_at = Utc::now();
            let attempt_clock = Instant::now();
            debug!(run_id = %ctx.run_id, operation = %ctx.operation, attempt, "Starting attempt");

            let result = match operation(attempt).await {
                Ok(result) => result,
                Err(e) => ActionResult::retryable(ErrorCode::UnknownError, format!("{:#}", e)),
            };
            let duration_ms = attempt_clock.elapsed().as_millis() as u64;

            let mut entry = ctx
                .entry(attempt, attempt_started_at, AttemptStatus::of(&result))
                .with_duration(duration_ms);
            match &result {
                ActionResult::Success { data } => {
                    entry = entry.with_output(serde_json::to_value(data).ok());
                }
                ActionResult::RetryableError { error } | ActionResult::FatalError { error } => {
                    entry = entry.with_error(error.clone());
                }
            }
            self.record(&entry).await;

            match result {
                ActionResult::Success { .. } => {
                    info!(run_id = %ctx.run_id, operation = %ctx.operation, attempt, duration_ms, "Attempt succeeded");
                    return RetryOutcome {
                        result,
                        attempts: attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                        errors,
                    };
                }
                ActionResult::FatalError { ref error } => {
                    error!(run_id = %ctx.run_id, operation = %ctx.operation, attempt, error = %error, "Attempt failed fatally");
                    return RetryOutcome {
                        result,
                        attempts: attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                        errors,
                    };
                }
                ActionResult::RetryableError { error } => {
                    errors.record(&error);

                    if attempt >= max_attempts {
                        break;
                    }

                    let delay = config.delay_for_attempt(attempt, &mut rand::thread_rng());
                    warn!(
                        run_id = %ctx.run_id,
                        operation = %ctx.operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }

        let error = ActionError::new(
            ErrorCode::MaxRetriesExceeded,
            format!(
                "Operation '{}' {} (max attempts {})",
                ctx.operation,
                errors.summary(),
                max_attempts
            ),
        );

        let entry = ctx
            .entry(max_attempts, Utc::now(), AttemptStatus::Exhausted)
            .with_duration(started.elapsed().as_millis() as u64)
            .with_error(error.clone());
        self.record(&entry).await;

        error!(run_id = %ctx.run_id, operation = %ctx.operation, attempts = max_attempts, error = %error, "Retries exhausted");

        RetryOutcome {
            result: ActionResult::FatalError { error },
            attempts: max_attempts,
            duration_ms: started.elapsed().as_millis() as u64,
            errors,
        }
    }

    async fn cancelled<T>(
        &self,
        ctx: &RetryContext,
        attempts: u32,
        started: Instant,
        errors: ErrorContext,
    ) -> RetryOutcome<T> {
        let error = ActionError::new(
            ErrorCode::ExecutionCancelled,
            format!("Run {} was cancelled after {} attempt(s)", ctx.run_id, attempts),
        );

        let entry = ctx
            .entry(attempts, Utc::now(), AttemptStatus::Cancelled)
            .with_duration(started.elapsed().as_millis() as u64)
            .with_error(error.clone());
        self.record(&entry).await;

        info!(run_id = %ctx.run_id, operation = %ctx.operation, attempts, "Run cancelled, stopping retries");

        RetryOutcome {
            result: ActionResult::FatalError { error },
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
            errors,
        }
    }

    async fn record(&self, entry: &AttemptLogEntry) {
        if let Err(e) = self.store.append_attempt(entry).await {
            error!(run_id = %entry.run_id, attempt = entry.attempt, error = %e, "Failed to append attempt log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRunStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor() -> (RetryExecutor, Arc<MemoryRunStore>) {
        let store = Arc::new(MemoryRunStore::new());
        (RetryExecutor::new(store.clone()), store)
    }

    fn context() -> RetryContext {
        RetryContext::new("run_1", "scn_1", "execute_action:test", "manual:scn_1:1:abc")
    }

    #[test]
    fn test_backoff_delays() {
        let config = RetryConfig {
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 10000,
            jitter_ms: None,
            ..Default::default()
        };

        assert_eq!(config.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(8000));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(10000)); // Capped
        assert_eq!(config.backoff_delay(500), Duration::from_millis(10000));
    }

    #[test]
    fn test_zero_initial_delay_never_backs_off() {
        let config = RetryConfig {
            initial_delay_ms: 0,
            backoff_factor: 2.0,
            max_delay_ms: 10000,
            jitter_ms: None,
            ..Default::default()
        };

        assert_eq!(config.backoff_delay(1), Duration::ZERO);
        assert_eq!(config.backoff_delay(2000), Duration::ZERO);
        assert_eq!(config.backoff_delay(u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_backoff_is_monotonic_and_bounded() {
        let config = RetryConfig {
            initial_delay_ms: 150,
            backoff_factor: 1.7,
            max_delay_ms: 5000,
            jitter_ms: Some(0),
            max_attempts: 20,
        };

        let delays: Vec<Duration> = (1..20).map(|i| config.backoff_delay(i)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(5000)));
    }

    #[test]
    fn test_jitter_is_additive() {
        let config = RetryConfig {
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 1000,
            jitter_ms: Some(40),
            max_attempts: 5,
        };
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 1..5 {
            let floor = config.backoff_delay(attempt);
            for _ in 0..50 {
                let delay = config.delay_for_attempt(attempt, &mut rng);
                assert!(delay >= floor);
                assert!(delay <= floor + Duration::from_millis(40));
            }
        }
    }

    #[test]
    fn test_preset_names() {
        assert_eq!(RetryPreset::from_name("fast"), RetryPreset::Fast);
        assert_eq!(RetryPreset::from_name("EXTERNAL"), RetryPreset::External);
        assert_eq!(RetryPreset::from_name("nonsense"), RetryPreset::Standard);

        for preset in [
            RetryPreset::Fast,
            RetryPreset::Standard,
            RetryPreset::Slow,
            RetryPreset::External,
        ] {
            assert!(preset.config().validate().is_ok(), "{} is invalid", preset);
        }
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut config = RetryConfig::immediate(0);
        assert_eq!(config.validate(), Err(RetryConfigError::NoAttempts));

        config = RetryConfig {
            initial_delay_ms: 500,
            max_delay_ms: 100,
            ..RetryConfig::immediate(2)
        };
        assert!(matches!(
            config.validate(),
            Err(RetryConfigError::MaxBelowInitial { .. })
        ));

        config = RetryConfig {
            backoff_factor: 0.5,
            ..RetryConfig::immediate(2)
        };
        assert!(matches!(
            config.validate(),
            Err(RetryConfigError::InvalidBackoffFactor(_))
        ));
    }

    #[test]
    fn test_config_yaml_defaults() {
        let config: RetryConfig = serde_yaml::from_str("max_attempts: 7").unwrap();
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.initial_delay_ms, 1000);
        assert_eq!(config.jitter_ms, None);
    }

    #[tokio::test]
    async fn test_success_after_retries() {
        let (executor, store) = executor();

        let outcome = executor
            .execute_with_retry(&context(), &RetryConfig::immediate(5), |attempt| async move {
                if attempt < 3 {
                    Ok(ActionResult::retryable("FLAKY", "try again"))
                } else {
                    Ok(ActionResult::success(attempt))
                }
            })
            .await;

        assert_eq!(outcome.result, ActionResult::success(3));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.errors.count, 2);

        let entries = store.attempts("run_1").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].status, AttemptStatus::Success);
        assert_eq!(entries[2].output, Some(serde_json::json!(3)));
    }

    #[tokio::test]
    async fn test_exhaustion_stops_at_max_attempts() {
        let (executor, store) = executor();
        let calls = AtomicU32::new(0);

        let outcome = executor
            .execute_with_retry(&context(), &RetryConfig::immediate(4), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(ActionResult::<()>::retryable("FLAKY", "still down")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        let error = outcome.result.error().unwrap();
        assert_eq!(error.code, ErrorCode::MaxRetriesExceeded);
        assert!(error.message.contains("failed 4 times"));
        assert!(error.message.contains("FLAKY: still down"));

        let entries = store.attempts("run_1").await.unwrap();
        assert_eq!(entries.iter().filter(|e| e.is_invocation()).count(), 4);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[4].status, AttemptStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_fatal_short_circuits() {
        let (executor, store) = executor();
        let calls = AtomicU32::new(0);

        let outcome = executor
            .execute_with_retry(&context(), &RetryConfig::immediate(5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(ActionResult::<()>::fatal(ErrorCode::ValidationFailed, "bad")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.is_fatal());
        assert_eq!(store.attempts("run_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_operation_errors_are_retryable_unknown() {
        let (executor, _store) = executor();

        let outcome = executor
            .execute_with_retry(&context(), &RetryConfig::immediate(2), |attempt| async move {
                if attempt == 1 {
                    anyhow::bail!("connection reset");
                }
                Ok(ActionResult::success("ok"))
            })
            .await;

        assert!(outcome.result.is_success());
        assert_eq!(outcome.attempts, 2);
        let last = outcome.errors.last.unwrap();
        assert_eq!(last.code, ErrorCode::UnknownError);
        assert!(last.message.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_next_attempt() {
        use crate::domain::IdempotencyKey;
        use crate::store::NewRun;

        let (executor, store) = executor();
        let created = store
            .create_or_find_run(NewRun {
                key: IdempotencyKey::new("scn_1", "manual", "c1"),
                node_id: None,
                connection_id: None,
            })
            .await
            .unwrap();
        let run_id = created.run.run_id.clone();

        let probe = CancellationProbe::new(store.clone(), run_id.clone());
        let ctx = RetryContext::new(run_id.clone(), "scn_1", "op", "c1").with_cancellation(probe);
        let calls = AtomicU32::new(0);

        let outcome = executor
            .execute_with_retry(&ctx, &RetryConfig::immediate(5), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                let store = store.clone();
                let run_id = run_id.clone();
                async move {
                    store
                        .update_run(
                            &run_id,
                            Box::new(|run| {
                                run.status = RunStatus::Cancelled;
                                true
                            }),
                        )
                        .await?;
                    Ok(ActionResult::<()>::retryable("FLAKY", "down"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.result.error().unwrap().code,
            ErrorCode::ExecutionCancelled
        );

        let entries = store.attempts(&run_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].status, AttemptStatus::Cancelled);
    }
}
