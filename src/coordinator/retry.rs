//! Retry policies for bounded sub-operations.
//!
//! The pipeline never replays a whole request. Only two sub-operations are
//! retried, each with a fixed bound:
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `allocation_race_policy(n)` | 1ms | 50ms | n - 1 | Lost create-if-absent races for the next free value |
//! | `coordination_policy` | 10ms | 500ms | 3 | Idempotent coordination reads |
//!
//! All policies include jitter so that racing coordinators do not retry in
//! lock-step.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use super::metrics;
use crate::error::{TxnError, TxnResult};

/// Policy for re-attempting a lost race on the next free value.
///
/// `max_attempts` counts the first try, so the policy allows
/// `max_attempts - 1` retries.
pub fn allocation_race_policy(max_attempts: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(50))
        .with_max_times(max_attempts.saturating_sub(1) as usize)
        .with_jitter()
}

/// Policy for idempotent reads against the coordination service.
pub fn coordination_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Run an idempotent coordination read, retrying transient failures.
pub async fn with_coordination_policy<F, Fut, T>(operation: F) -> TxnResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TxnResult<T>>,
{
    operation
        .retry(coordination_policy())
        .when(TxnError::is_retriable)
        .notify(|err: &TxnError, delay: Duration| {
            record_retry_attempt("coordination", err, delay);
        })
        .await
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, err: &TxnError, delay: Duration) {
    metrics::record_retry(policy_name);
    tracing::debug!(
        policy = policy_name,
        error = %err,
        delay_ms = delay.as_millis() as u64,
        "Retrying operation"
    );
}
