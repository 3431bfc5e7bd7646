//! Bounded retry with exponential backoff.
//!
//! Every store call made by the synchronizer goes through
//! [`retry_with_backoff`], so throttling is handled the same way at each call
//! site instead of ad hoc.
//!
//! ```text
//! ├─→ Attempt 1: Immediate
//! ├─→ Attempt 2: Wait 100ms (or the store's retry_after hint)
//! ├─→ Attempt 3: Wait 200ms
//! ├─→ Attempt 4: Wait 400ms
//! └─→ ...        capped at max_backoff
//! ```
//!
//! Only errors for which [`StoreError::is_retryable`] holds are retried.
//! A shutdown request during a backoff wait ends the loop early and returns
//! the last error.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::shutdown::Shutdown;

/// Retry policy configuration for exponential backoff.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call
    pub max_retries: usize,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }

    /// Delay before the next attempt after `error`: the store's own hint
    /// when it gave one, the exponential backoff otherwise.
    pub fn delay_for(&self, attempt: usize, error: &StoreError) -> Duration {
        match error.retry_after() {
            Some(hint) => hint.min(self.max_backoff),
            None => self.backoff(attempt),
        }
    }
}

/// Retry a store operation with exponential backoff.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `max_retries` is exhausted or shutdown is requested.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match call().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(operation, attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        code = err.code(),
                        error = %err,
                        "Max retries exhausted, giving up"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for(attempt, &err);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = delay.as_millis() as u64,
                    code = err.code(),
                    error = %err,
                    "Retryable error, backing off"
                );

                if !shutdown.sleep(delay).await {
                    debug!(operation, "Shutdown requested during backoff");
                    return Err(err);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(10),
            2.0,
        )
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_honours_retry_after() {
        let policy = RetryPolicy::default();
        let throttled = StoreError::Transient {
            operation: "upsert".to_string(),
            message: "429".to_string(),
            retry_after: Some(Duration::from_millis(750)),
        };
        assert_eq!(policy.delay_for(0, &throttled), Duration::from_millis(750));

        let huge = StoreError::Transient {
            operation: "upsert".to_string(),
            message: "429".to_string(),
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(policy.delay_for(0, &huge), Duration::from_secs(30));

        let plain = StoreError::transient("upsert", "busy");
        assert_eq!(policy.delay_for(1, &plain), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&fast_policy(5), &Shutdown::new(), "op", || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(StoreError::transient("op", "busy"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(5), &Shutdown::new(), "op", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unavailable("gone".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&fast_policy(3), &Shutdown::new(), "op", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::transient("op", "busy")) }
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&RetryPolicy::none(), &Shutdown::new(), "op", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::transient("op", "busy")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_backoff() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let policy = RetryPolicy::new(
            10,
            Duration::from_secs(60),
            Duration::from_secs(60),
            2.0,
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = tokio::time::timeout(
            Duration::from_secs(1),
            retry_with_backoff(&policy, &shutdown, "op", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::transient("op", "busy")) }
            }),
        )
        .await
        .expect("retry loop should observe shutdown");

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
