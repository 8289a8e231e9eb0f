//! Bounded retry for transport-level gateway calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::ProcessingLimits;
use crate::error::GatewayError;

/// Fixed-delay retry.
///
/// Runs `max_attempts - 1` guarded attempts that retry on
/// [`ErrorClass::Retryable`](crate::error::ErrorClass) errors, then one final
/// attempt whose error is returned as-is. Permanent errors are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub fn from_limits(limits: &ProcessingLimits) -> Self {
        Self::new(limits.max_retry_attempts, limits.retry_delay())
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Run `op`, retrying retryable failures.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let guarded = self.max_attempts().saturating_sub(1);
        for attempt in 1..=guarded {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts = self.max_attempts(),
                        error = %e,
                        "Retryable failure, retrying after {:?}",
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        op().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn flaky(
        calls: &AtomicU32,
        failures: u32,
        err: GatewayError,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, GatewayError>> + '_ {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < failures { Err(err.clone()) } else { Ok(n) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        let start = Instant::now();

        let result = policy
            .run("fetch", flaky(&calls, 2, GatewayError::Connection("reset".into())))
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_surface_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let result = policy
            .run("move", flaky(&calls, 10, GatewayError::Transient("BYE".into())))
            .await;

        assert!(matches!(result, Err(GatewayError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_secs(1));

        let result = policy
            .run(
                "append",
                flaky(&calls, 10, GatewayError::FolderNotFound("Archive".into())),
            )
            .await;

        assert!(matches!(result, Err(GatewayError::FolderNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let result = policy
            .run("fetch", flaky(&calls, 0, GatewayError::NotConnected))
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
