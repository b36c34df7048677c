//! # Retry policy.
//!
//! Decides whether a failed subscription is attempted again and how long
//! to wait first.
//!
//! ```text
//! Error(e) ──► e.is_retryable()? ──no──► propagate e
//!                   │yes
//!                   ▼
//!          attempts < max_retries? ──no──► propagate e             (no backoff)
//!                   │yes                   RetryExhausted{e}       (with backoff)
//!                   ▼
//!          resubscribe now | after backoff.next(attempt)
//! ```

use std::time::Duration;

use super::BackoffPolicy;
use crate::error::FluxError;

/// Outcome of consulting a [`RetryPolicy`] after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Resubscribe on the current thread.
    Now,
    /// Resubscribe after the delay.
    After(Duration),
    /// Stop and propagate the error.
    GiveUp,
}

/// How many times, and how, an erroring pipeline is resubscribed.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum number of resubscriptions.
    pub max_retries: u32,
    /// Delay schedule; `None` resubscribes immediately.
    pub backoff: Option<BackoffPolicy>,
}

impl RetryPolicy {
    /// Resubscribes immediately, at most `max_retries` times.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: None,
        }
    }

    /// Resubscribes after the backoff delay, at most `max_retries` times.
    pub fn with_backoff(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff: Some(backoff),
        }
    }

    /// Decides what to do after failure number `attempt` (0-based count of
    /// resubscriptions already performed).
    pub fn decide(&self, error: &FluxError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        match &self.backoff {
            None => RetryDecision::Now,
            Some(b) => RetryDecision::After(b.next(attempt)),
        }
    }

    /// Builds the error emitted once retries are exhausted.
    pub fn exhausted(&self, error: FluxError, attempts: u32) -> FluxError {
        if self.backoff.is_some() && error.is_retryable() {
            FluxError::RetryExhausted {
                attempts,
                source: Box::new(error),
            }
        } else {
            error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_gives_up_after_max() {
        let policy = RetryPolicy::immediate(2);
        let err = FluxError::msg("flaky");
        assert_eq!(policy.decide(&err, 0), RetryDecision::Now);
        assert_eq!(policy.decide(&err, 1), RetryDecision::Now);
        assert_eq!(policy.decide(&err, 2), RetryDecision::GiveUp);
        assert_eq!(policy.exhausted(err, 2).as_label(), "flux_domain");
    }

    #[test]
    fn test_backoff_wraps_exhaustion() {
        let policy = RetryPolicy::with_backoff(3, BackoffPolicy::fixed(Duration::from_secs(1)));
        let err = FluxError::msg("down");
        assert_eq!(
            policy.decide(&err, 0),
            RetryDecision::After(Duration::from_secs(1))
        );
        let exhausted = policy.exhausted(err, 3);
        assert_eq!(exhausted.as_label(), "flux_retry_exhausted");
        assert_eq!(exhausted.root_cause().to_string(), "down");
    }

    #[test]
    fn test_non_retryable_never_retried() {
        let policy = RetryPolicy::immediate(10);
        let fatal = FluxError::protocol("backpressure", "x");
        assert_eq!(policy.decide(&fatal, 0), RetryDecision::GiveUp);
        assert!(policy.exhausted(fatal, 0).is_fatal());
    }
}
