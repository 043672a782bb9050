//! Per-request retry state.

use std::time::Duration;

use crate::error::RequestError;

/// Decides whether a failed attempt is retried and how long the next
/// attempt may take.
///
/// A policy is owned by a single request; the network leg consults
/// [`current_timeout`](RetryPolicy::current_timeout) before every attempt
/// and calls [`retry`](RetryPolicy::retry) on every retriable error.
pub trait RetryPolicy: Send {
    /// The timeout to apply to the next transport attempt.
    fn current_timeout(&self) -> Duration;

    /// Number of retries performed so far.
    fn retry_count(&self) -> u32;

    /// Records a failed attempt. Returns `Ok(())` when another attempt may
    /// be made, or gives `error` back when attempts are exhausted.
    fn retry(&mut self, error: RequestError) -> Result<(), RequestError>;
}

/// Default socket timeout, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2_500;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default backoff multiplier: each retry keeps the same timeout.
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.0;

/// The standard exponential-backoff policy.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    current_timeout: Duration,
    retry_count: u32,
    max_retries: u32,
    backoff_multiplier: f32,
}

impl DefaultRetryPolicy {
    /// A policy with the default timeout, retry budget, and backoff.
    #[must_use]
    pub fn new() -> Self {
        Self::with_values(
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
            DEFAULT_MAX_RETRIES,
            DEFAULT_BACKOFF_MULTIPLIER,
        )
    }

    /// A policy with explicit initial timeout, retry budget, and backoff
    /// multiplier.
    #[must_use]
    pub fn with_values(
        initial_timeout: Duration,
        max_retries: u32,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            current_timeout: initial_timeout,
            retry_count: 0,
            max_retries,
            backoff_multiplier,
        }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn retry(&mut self, error: RequestError) -> Result<(), RequestError> {
        self.retry_count += 1;
        self.current_timeout +=
            self.current_timeout.mul_f32(self.backoff_multiplier);
        if self.retry_count > self.max_retries {
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_one_retry() {
        let mut policy = DefaultRetryPolicy::new();
        assert_eq!(policy.current_timeout(), Duration::from_millis(2_500));
        assert!(policy.retry(RequestError::Timeout).is_ok());
        assert!(matches!(
            policy.retry(RequestError::Timeout),
            Err(RequestError::Timeout)
        ));
    }

    #[test]
    fn backoff_grows_timeout_per_attempt() {
        let mut policy = DefaultRetryPolicy::with_values(
            Duration::from_millis(1_000),
            3,
            2.0,
        );
        assert!(policy.retry(RequestError::Timeout).is_ok());
        assert_eq!(policy.current_timeout(), Duration::from_millis(3_000));
        assert!(policy.retry(RequestError::Timeout).is_ok());
        assert_eq!(policy.current_timeout(), Duration::from_millis(9_000));
        assert_eq!(policy.retry_count(), 2);
    }

    #[test]
    fn exhaustion_returns_the_original_error() {
        let mut policy =
            DefaultRetryPolicy::with_values(Duration::from_millis(100), 0, 1.0);
        let err = policy
            .retry(RequestError::NoConnection { reason: "refused".into() })
            .unwrap_err();
        assert!(matches!(err, RequestError::NoConnection { .. }));
    }
}
