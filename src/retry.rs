//! Backoff and error classification shared by watchers and the relay engine.

use eyre::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for RPC access: linear backoff of `base * attempt`, capped
/// attempts. Watchers and relays never retry past this; exhaustion surfaces
/// to the coordinator as a non-fatal error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base * attempt
    }
}

/// Classifies errors for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure: RPC timeout, connection reset, rate limit.
    Transient,
    /// Permanent failure: revert, invalid parameters, rejected signature.
    Permanent,
    /// Anything else; retried with backoff like a transient.
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// Classify an error message for retry decisions.
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("timed out")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("429")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
        || error_lower.contains("nonce")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("invalid parameters")
        || error_lower.contains("already processed")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Run an operation with the policy's backoff. Permanent errors and
/// exhaustion return the last error to the caller.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                let class = classify_error(&e.to_string());
                if class == ErrorClass::Permanent || attempt >= policy.max_attempts {
                    return Err(e);
                }
                let backoff = policy.backoff_for_attempt(attempt);
                warn!(
                    what = what,
                    attempt = attempt,
                    max = policy.max_attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "Retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_linear_in_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(3));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(6));
        assert_eq!(policy.backoff_for_attempt(5), Duration::from_secs(15));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection reset by peer"), ErrorClass::Transient);
        assert_eq!(classify_error("HTTP 429 Too Many Requests"), ErrorClass::Transient);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("invalid signature"), ErrorClass::Permanent);
        assert_eq!(classify_error("something odd"), ErrorClass::Unknown);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_retry() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result: Result<()> = with_backoff(&policy, "test", || {
            calls += 1;
            async { Err(eyre::eyre!("execution reverted")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_exhaustion() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result: Result<()> = with_backoff(&policy, "test", || {
            calls += 1;
            async { Err(eyre::eyre!("request timeout")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_success_after_transient_failure() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result = with_backoff(&policy, "test", || {
            calls += 1;
            let ok = calls > 1;
            async move {
                if ok {
                    Ok(7)
                } else {
                    Err(eyre::eyre!("connection refused"))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }
}
