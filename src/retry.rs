//! Linear-backoff retry with a deadline per attempt.

use crate::error::TransportError;
use chrono::Utc;
use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `base_delay * n`.
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(crate::config::RETRY_BASE_DELAY_MS),
            attempt_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Runs `call(attempt)` until it succeeds or `max_attempts` is exhausted.
/// Every attempt of one logical request shares `request_id`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    request_id: &str,
    mut call: F,
) -> Result<T, TransportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(policy.attempt_timeout, call(attempt)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: policy.attempt_timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("[retry] {} succeeded on attempt {}", request_id, attempt);
                }
                return Ok(value);
            }
            Err(error) if attempt < max_attempts => {
                let delay = policy.base_delay * attempt;
                log::warn!(
                    "[retry] {} attempt {}/{} failed: {}; retrying in {}ms",
                    request_id,
                    attempt,
                    max_attempts,
                    error,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                log::error!(
                    "[retry] {} giving up after {} attempt(s): {}",
                    request_id,
                    attempt,
                    error
                );
                return Err(error);
            }
        }
    }
}

/// Generates `req_<unix_millis>_<counter>` identifiers.
#[derive(Debug, Default)]
pub struct RequestIds {
    counter: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req_{}_{}", Utc::now().timestamp_millis(), n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_millis(30_000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_call_makes_exactly_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), _> = with_retry(&policy(3), "req_1_1", |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Network("provider_unreachable".to_string())) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let error = result.unwrap_err();
        assert_eq!(error.to_string(), "Network error: provider_unreachable");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_linear() {
        let start = Instant::now();
        let result: Result<(), _> = with_retry(&policy(3), "req_1_2", |_| async {
            Err(TransportError::Network("down".to_string()))
        })
        .await;
        assert!(result.is_err());
        // 1000ms after attempt 1, 2000ms after attempt 2.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_a_later_attempt() {
        let result = with_retry(&policy(3), "req_1_3", |attempt| async move {
            if attempt < 2 {
                Err(TransportError::Status {
                    status: 502,
                    reason: "provider_unavailable".to_string(),
                })
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out_and_is_retried() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_millis(500),
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), _> = with_retry(&policy, "req_1_4", |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::pending()
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(result, Err(TransportError::Timeout { timeout_ms: 500 }));
    }

    #[tokio::test]
    async fn zero_attempts_still_calls_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = with_retry(&policy(0), "req_1_5", |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TransportError>(()) }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn request_ids_are_prefixed_and_increasing() {
        let ids = RequestIds::new();
        let first = ids.next();
        let second = ids.next();
        assert!(first.starts_with("req_"));
        assert!(first.ends_with("_1"));
        assert!(second.ends_with("_2"));
    }
}
