use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use crate::issuance::ca::CaError;

/// Bounds for every retry loop in the orchestrator: validation attempts and
/// transient CA failures both run under the same policy so total work stays
/// bounded.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for a 1-based attempt number, capped at
    /// `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial_backoff.as_millis() as u64;
        Duration::from_millis(base.saturating_mul(1u64 << exp)).min(self.max_backoff)
    }
}

/// Runs a CA call, retrying transient failures with capped exponential
/// backoff until the policy's attempt budget is spent. Fatal CA errors are
/// returned immediately. A `RateLimited` retry-after hint stretches the wait
/// when it is longer than the computed backoff (still capped).
///
/// The waits are tokio sleeps, so dropping the caller's future cancels the
/// loop promptly.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, CaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CaError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => {
                debug!("[retry] {operation} succeeded on attempt {attempt}");
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let mut wait = policy.backoff_for(attempt);
                if let Some(hint) = err.retry_after() {
                    wait = wait.max(hint).min(policy.max_backoff);
                }
                debug!(
                    "[retry] {operation} attempt {attempt} failed transiently ({err}), \
                     retrying in {}ms",
                    wait.as_millis()
                );
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(
                        "[retry] {operation} still failing after {attempt} attempts: {err}"
                    );
                } else {
                    warn!("[retry] {operation} failed fatally on attempt {attempt}: {err}");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(9), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn succeeds_immediately_without_retrying() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let result = retry_transient(&fast_policy(), "test", move || {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok::<_, CaError>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let result = retry_transient(&fast_policy(), "test", move || {
            let counter = counter.clone();
            async move {
                let mut count = counter.lock().unwrap();
                *count += 1;
                if *count < 3 {
                    Err(CaError::Unavailable("down".into()))
                } else {
                    Ok("up")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "up");
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn stops_immediately_on_fatal_error() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_transient(&fast_policy(), "test", move || {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err(CaError::RejectedIdentifier("bad domain".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(CaError::RejectedIdentifier(_))));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn surfaces_transient_error_after_budget_spent() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_transient(&fast_policy(), "test", move || {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Err(CaError::Unavailable("still down".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(CaError::Unavailable(_))));
        assert_eq!(*calls.lock().unwrap(), 4);
    }
}
