//! Retry with exponential backoff around model calls.

use crate::llm::ModelError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Injectable sleep, so tests can observe backoff without waiting
pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// `tokio::time::sleep` as a [`SleepFn`]
pub fn tokio_sleeper() -> SleepFn {
    Arc::new(|delay| Box::pin(tokio::time::sleep(delay)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, attempt: u32, error: &ModelError) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = (attempt.saturating_sub(1)) as i32;
        let unbounded = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(unbounded.min(self.max_backoff.as_secs_f64()))
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: ModelError,
    /// True when the last error was transient and attempts ran out
    pub exhausted: bool,
}

/// Run `execute` until it succeeds, fails with a non-transient error, or
/// attempts run out. `on_retry` sees each scheduled retry.
pub async fn execute_with_retry<T, Op, OpFuture>(
    operation: &str,
    policy: &RetryPolicy,
    sleep: &SleepFn,
    mut on_retry: impl FnMut(u32, Duration, &ModelError),
    mut execute: Op,
) -> Result<T, RetryFailure>
where
    Op: FnMut(u32) -> OpFuture,
    OpFuture: Future<Output = Result<T, ModelError>>,
{
    let mut attempt = 1;

    loop {
        match execute(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(target: "orchestrator", operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if policy.should_retry(attempt, &error) {
                    let delay = policy.backoff_for_attempt(attempt);
                    warn!(
                        target: "orchestrator",
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    on_retry(attempt, delay, &error);
                    sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                return Err(RetryFailure {
                    attempts: attempt,
                    exhausted: error.is_transient(),
                    error,
                });
            }
        }
    }
}
