//! # Backoff between resubscriptions.
//!
//! [`BackoffPolicy`] computes how long `retry_with` waits before
//! resubscribing after the `n`-th failure:
//!
//! ```text
//! delay(n) = jitter(min(first × factor^n, max))
//! ```
//!
//! The base is derived from the attempt number only, so jitter never feeds
//! back into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use rivulet::BackoffPolicy;
//!
//! let backoff = BackoffPolicy::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(1));
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(100));
//! assert_eq!(backoff.next(3), Duration::from_millis(800));
//! assert_eq!(backoff.next(10), Duration::from_secs(1));
//! ```

use std::time::Duration;

use super::JitterPolicy;

/// Delay schedule for retries.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first resubscription.
    pub first: Duration,
    /// Upper bound of any delay.
    pub max: Duration,
    /// Growth factor per attempt; `1.0` is a fixed delay.
    pub factor: f64,
    /// Randomization of each delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Exponential backoff from 100ms doubling up to 30s, no jitter.
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100))
    }
}

impl BackoffPolicy {
    /// Constant delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Doubling delay starting at `first`, capped at 30s.
    pub fn exponential(first: Duration) -> Self {
        Self {
            first,
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Replaces the cap.
    #[must_use]
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Replaces the jitter policy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before resubscription number `attempt` (0-based).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if secs.is_finite() && secs >= 0.0 && secs <= self.max.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max
        };
        self.jitter.apply(base, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(250));
        for attempt in [0, 1, 7, 1000] {
            assert_eq!(policy.next(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_exponential_grows_then_caps() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1)).with_max(Duration::from_secs(10));
        assert_eq!(policy.next(0), Duration::from_secs(1));
        assert_eq!(policy.next(1), Duration::from_secs(2));
        assert_eq!(policy.next(2), Duration::from_secs(4));
        assert_eq!(policy.next(4), Duration::from_secs(10));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_first_above_max_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(10)).with_max(Duration::from_secs(5));
        assert_eq!(policy.next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(2))
            .with_jitter(JitterPolicy::Factor(0.5));
        for attempt in 0..20 {
            assert!(policy.next(attempt) <= Duration::from_secs(2));
        }
    }
}
