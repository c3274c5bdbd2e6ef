//! Bounded exponential backoff around a single HTTP exchange.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::transport::{HttpResponse, TransportError};

/// Retry ceiling and backoff curve.
///
/// Delays only grow strictly while `base_delay · 2^(max_retries - 1)` stays
/// within `max_delay`; past that they plateau at the cap. Config validation
/// flags policies that would plateau.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): `base · 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Whether a status is worth retrying: 5xx and 429.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Run `send` until it yields a non-retryable outcome or the policy is
/// exhausted.
///
/// A retryable response that survives every attempt is returned as-is so
/// the caller can classify it; the same goes for the last transport error.
pub async fn with_retry<F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut send: F,
) -> Result<HttpResponse, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<HttpResponse, TransportError>>,
{
    let mut attempt = 0;
    loop {
        let outcome = send().await;

        let retryable = match &outcome {
            Ok(response) => is_retryable_status(response.status),
            Err(_) => true,
        };
        if !retryable || attempt >= policy.max_retries {
            return outcome;
        }

        let delay = policy.delay_for(attempt);
        match &outcome {
            Ok(response) => warn!(
                request = label,
                status = response.status,
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                backoff_ms = delay.as_millis() as u64,
                "Request failed, retrying"
            ),
            Err(e) => warn!(
                request = label,
                error = %e,
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                backoff_ms = delay.as_millis() as u64,
                "Request failed, retrying"
            ),
        }
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        }
    }

    fn response(status: u16) -> HttpResponse {
        HttpResponse::new(status, Vec::new())
    }

    #[test]
    fn test_delay_curve_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(350));
        assert_eq!(p.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_bounded_and_delays_increase() {
        let p = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        };
        let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let seen = attempts.clone();
        let outcome = with_retry(&p, "test", || {
            seen.lock().push(tokio::time::Instant::now());
            async { Ok(response(503)) }
        })
        .await;

        assert_eq!(outcome.unwrap().status, 503);
        let attempts = attempts.lock();
        assert_eq!(attempts.len(), 3);
        let first_gap = attempts[1] - attempts[0];
        let second_gap = attempts[2] - attempts[1];
        assert_eq!(first_gap, Duration::from_millis(500));
        assert_eq!(second_gap, Duration::from_millis(1000));
        assert!(second_gap > first_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = with_retry(&policy(), "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(response(422)) }
        })
        .await;

        assert_eq!(outcome.unwrap().status, 422);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = with_retry(&policy(), "test", || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TransportError::Connect("refused".to_string()))
                } else {
                    Ok(response(200))
                }
            }
        })
        .await;

        assert_eq!(outcome.unwrap().status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = with_retry(&RetryPolicy::none(), "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Timeout) }
        })
        .await;

        assert!(matches!(outcome, Err(TransportError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
