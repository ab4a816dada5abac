//! Connection retry with bounded exponential backoff.
//!
//! Only transport-level failures are retried. Authentication problems, bad
//! configuration and anything a provider reports are surfaced immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ConnectionError;

/// How many times, and how patiently, `connect` is retried.
///
/// Delays double from `initial_delay` up to `max_delay`; with `jitter`
/// set, each delay is drawn from the upper half of that window so that
/// parallel sessions to one bastion do not reconnect in lockstep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the wait before retry number `retry` (0-based).
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Wait before retry number `retry`.
    pub fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.backoff_ceiling(retry);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let floor = ceiling / 2;
        rand::thread_rng().gen_range(floor..=ceiling)
    }
}

/// Run `operation` until it succeeds, fails for a non-connectivity reason,
/// or `max_retries` extra attempts are spent.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
{
    let mut retries = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !error.is_connectivity() || retries >= policy.max_retries {
            if retries > 0 {
                warn!(attempts = retries + 1, error = %error, "Giving up on connection");
            }
            return Err(error);
        }
        let delay = policy.delay(retries);
        debug!(retry = retries + 1, ?delay, error = %error, "Connection failed, retrying");
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    async fn count_calls(
        policy: &RetryPolicy,
        fail_times: u32,
        error: fn() -> ConnectionError,
    ) -> (bool, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry(policy, || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < fail_times {
                    Err(error())
                } else {
                    Ok(())
                }
            }
        })
        .await;
        (result.is_ok(), calls.load(Ordering::SeqCst))
    }

    fn refused() -> ConnectionError {
        ConnectionError::connection_failed("h", "refused")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ceiling(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_ceiling(30), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_delay_within_window() {
        let policy = RetryPolicy::default();
        for retry in 0..6 {
            let ceiling = policy.backoff_ceiling(retry);
            let delay = policy.delay(retry);
            assert!(delay <= ceiling && delay >= ceiling / 2);
        }
    }

    #[tokio::test]
    async fn test_retries_connectivity_then_succeeds() {
        assert_eq!(count_calls(&quick(), 2, refused).await, (true, 3));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        assert_eq!(count_calls(&quick(), 10, refused).await, (false, 3));
    }

    #[tokio::test]
    async fn test_auth_failures_are_final() {
        fn denied() -> ConnectionError {
            ConnectionError::AuthenticationFailed {
                host: "h".into(),
                message: "denied".into(),
            }
        }
        assert_eq!(count_calls(&quick(), 10, denied).await, (false, 1));
    }
}
