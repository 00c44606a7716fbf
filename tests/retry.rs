//! Retry Integration Tests
//!
//! Attempt counting, exhaustion, fatal short-circuit and backoff bounds.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stepwise::core::{RetryContext, RetryExecutor};
use stepwise::domain::{AttemptStatus, ErrorCode};
use stepwise::{ActionResult, MemoryRunStore, RetryConfig, RetryPreset, RunStore};

fn setup() -> (RetryExecutor, Arc<MemoryRunStore>, RetryContext) {
    let store = Arc::new(MemoryRunStore::new());
    let ctx = RetryContext::new("run_retry", "scn_retry", "execute_action:test", "manual:scn_retry:1:abc");
    (RetryExecutor::new(store.clone()), store, ctx)
}

#[tokio::test]
async fn test_success_on_attempt_k() {
    for k in 1..=4u32 {
        let (executor, store, ctx) = setup();
        let calls = AtomicU32::new(0);

        let outcome = executor
            .execute_with_retry(&ctx, &RetryConfig::immediate(5), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < k {
                        Ok(ActionResult::retryable("TRANSIENT", "try later"))
                    } else {
                        Ok(ActionResult::success(attempt))
                    }
                }
            })
            .await;

        assert_eq!(outcome.result, ActionResult::success(k));
        assert_eq!(outcome.attempts, k);
        assert_eq!(calls.load(Ordering::SeqCst), k);
        assert_eq!(store.attempts("run_retry").await.unwrap().len(), k as usize);
    }
}

#[tokio::test]
async fn test_exhaustion_after_exactly_m_invocations() {
    let (executor, store, ctx) = setup();
    let calls = AtomicU32::new(0);

    let outcome = executor
        .execute_with_retry(&ctx, &RetryConfig::immediate(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(ActionResult::<()>::retryable("TRANSIENT", "down")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.attempts, 3);
    assert!(outcome.result.is_fatal());
    assert_eq!(outcome.result.error().unwrap().code, ErrorCode::MaxRetriesExceeded);

    let entries = store.attempts("run_retry").await.unwrap();
    let invocations: Vec<u32> = entries
        .iter()
        .filter(|e| e.is_invocation())
        .map(|e| e.attempt)
        .collect();
    assert_eq!(invocations, vec![1, 2, 3]);
    assert_eq!(entries.last().unwrap().status, AttemptStatus::Exhausted);
}

#[tokio::test]
async fn test_fatal_on_first_attempt() {
    let (executor, store, ctx) = setup();
    let calls = AtomicU32::new(0);

    let outcome = executor
        .execute_with_retry(&ctx, &RetryConfig::immediate(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(ActionResult::<()>::fatal("BAD_REQUEST", "rejected")) }
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.result.error().unwrap().code.as_str(), "BAD_REQUEST");
    assert_eq!(store.attempts("run_retry").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_backoff_sleeps_at_least_the_floor() {
    let (executor, _store, ctx) = setup();
    let config = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 20,
        max_delay_ms: 30,
        backoff_factor: 2.0,
        jitter_ms: Some(5),
    };

    let started = Instant::now();
    let outcome = executor
        .execute_with_retry(&ctx, &config, |_| async {
            Ok(ActionResult::<()>::retryable("TRANSIENT", "down"))
        })
        .await;

    // 20ms after attempt 1, min(40, 30) = 30ms after attempt 2
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(outcome.attempts, 3);
}

#[test]
fn test_backoff_monotonic_for_every_preset() {
    for preset in [
        RetryPreset::Fast,
        RetryPreset::Standard,
        RetryPreset::Slow,
        RetryPreset::External,
    ] {
        let config = preset.config();
        let mut previous = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = config.backoff_delay(attempt);
            assert!(delay >= previous, "{} not monotonic at {}", preset, attempt);
            assert!(delay <= Duration::from_millis(config.max_delay_ms));
            previous = delay;
        }
        assert_eq!(
            config.backoff_delay(1),
            Duration::from_millis(config.initial_delay_ms)
        );
    }
}
