/// Bounded retries with exponential backoff and jitter

use crate::error::{PuenteError, PuenteResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error codes and message fragments treated as transient
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    "ECONNREFUSED",
    "ETIMEDOUT",
    "ECONNRESET",
    "EPIPE",
    "ENOTFOUND",
    "ESOCKET",
    "connection refused",
    "timed out",
    "timeout",
    "connection reset",
    "communication link failure",
    "pool timed out",
    "pool exhausted",
    "08S01",
    "08001",
    "08004",
    "HYT00",
    "HYT01",
    "40001",
    "1205",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of the random delay added to every backoff
    pub jitter: Duration,
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: Duration::from_millis(100),
            retryable_errors: DEFAULT_RETRYABLE_ERRORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    lowered: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let lowered = config
            .retryable_errors
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        Self { config, lowered }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self, error: &PuenteError) -> bool {
        if error.is_domain() || error.is_fatal() {
            return false;
        }
        match error {
            PuenteError::CircuitOpen { .. } | PuenteError::MaxRetriesExceeded { .. } => {
                return false
            }
            _ => {}
        }

        if let Some(code) = error.code() {
            if self
                .config
                .retryable_errors
                .iter()
                .any(|sig| sig.eq_ignore_ascii_case(code))
            {
                return true;
            }
        }

        let Some(detail) = error.detail() else {
            return false;
        };
        let detail = detail.to_ascii_lowercase();
        self.lowered.iter().any(|sig| detail.contains(sig.as_str()))
    }

    /// Backoff before retry number `retry` (1-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.config.initial_delay.as_millis() as f64
            * self.config.multiplier.powi(exponent);
        let capped = millis.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Backoff before retry number `retry`, jitter included
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay(retry) + Duration::from_millis(jitter)
    }

    /// Run `operation` until it succeeds, fails permanently or the budget is spent
    pub async fn execute<F, Fut, T>(&self, connection_id: &str, mut operation: F) -> PuenteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PuenteResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(connection_id, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !self.is_retryable(&error) => {
                    debug!(connection_id, attempt, error = %error, "error is not retryable");
                    return Err(error);
                }
                Err(error) if attempt >= max_attempts => {
                    warn!(connection_id, attempts = attempt, error = %error, "retry budget exhausted");
                    return Err(PuenteError::MaxRetriesExceeded {
                        connection_id: connection_id.to_string(),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                        source: Box::new(error),
                    });
                }
                Err(error) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        connection_id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            jitter: Duration::ZERO,
            ..RetryConfig::default()
        })
    }

    fn transient() -> PuenteError {
        PuenteError::backend("erp", Some("08S01"), "Communication link failure")
    }

    #[test]
    fn test_classification() {
        let policy = RetryPolicy::default();

        assert!(policy.is_retryable(&transient()));
        assert!(policy.is_retryable(&PuenteError::timeout("connect erp")));
        assert!(policy.is_retryable(&PuenteError::backend("erp", None, "Connection reset by peer")));
        assert!(policy.is_retryable(&PuenteError::backend("erp", Some("1205"), "deadlock victim")));

        assert!(!policy.is_retryable(&PuenteError::backend("erp", Some("42S02"), "Invalid object name")));
        assert!(!policy.is_retryable(&PuenteError::validation("connection refused")));
        assert!(!policy.is_retryable(&PuenteError::config_not_found("erp")));
    }

    #[test]
    fn test_connection_id_does_not_affect_classification() {
        let policy = RetryPolicy::default();

        let missing_table =
            PuenteError::backend("erp-timeout-replica", Some("42S02"), "Invalid object name 'itm'");
        assert!(!policy.is_retryable(&missing_table));

        let syntax = PuenteError::backend("erp-1205", None, "syntax error at or near \"FORM\"");
        assert!(!policy.is_retryable(&syntax));

        let reset = PuenteError::backend("erp-1205", None, "connection reset by peer");
        assert!(policy.is_retryable(&reset));
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fail_succeed() {
        let policy = no_jitter();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = policy
            .execute("erp", || async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(transient()),
                    _ => Ok("rows"),
                }
            })
            .await;

        assert_eq!(result.unwrap(), "rows");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_invoked_once() {
        let policy = no_jitter();
        let calls = AtomicU32::new(0);

        let err = policy
            .execute("erp", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PuenteError::NotFound {
                    message: "item 7530110".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, PuenteError::NotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let policy = no_jitter();
        let calls = AtomicU32::new(0);

        let err = policy
            .execute("erp", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            PuenteError::MaxRetriesExceeded {
                connection_id,
                attempts,
                source,
                ..
            } => {
                assert_eq!(connection_id, "erp");
                assert_eq!(attempts, 3);
                assert_eq!(source.code(), Some("08S01"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_budget() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });
        let err = policy
            .execute("erp", || async { Err::<(), _>(transient()) })
            .await
            .unwrap_err();
        assert!(matches!(err, PuenteError::MaxRetriesExceeded { attempts: 1, .. }));
    }
}
