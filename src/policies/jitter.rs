//! # Jitter for retry delays.
//!
//! [`JitterPolicy`] spreads resubscriptions of many failing pipelines so they
//! do not hit a recovering dependency at the same instant.
//!
//! - [`JitterPolicy::None`]: exact delay.
//! - [`JitterPolicy::Full`]: uniform in `[0, delay]`.
//! - [`JitterPolicy::Equal`]: `delay/2 + uniform[0, delay/2]`.
//! - [`JitterPolicy::Factor`]: uniform in `[delay × (1 - f), delay × (1 + f)]`.

use std::time::Duration;

use rand::Rng;

/// Randomization applied to a computed backoff delay.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum JitterPolicy {
    /// Use the delay unchanged. Required for deterministic virtual-time tests.
    #[default]
    None,
    /// Random delay in `[0, delay]`.
    Full,
    /// Keep half the delay, randomize the other half.
    Equal,
    /// Spread `±f` around the delay; `f` is clamped to `[0, 1]`.
    Factor(f64),
}

impl JitterPolicy {
    /// Applies jitter to `delay`, never exceeding `max`.
    pub fn apply(&self, delay: Duration, max: Duration) -> Duration {
        let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        let jittered = match *self {
            JitterPolicy::None => return delay.min(max),
            JitterPolicy::Full => rng.random_range(0..=ms),
            JitterPolicy::Equal => {
                let half = ms / 2;
                half + rng.random_range(0..=ms - half)
            }
            JitterPolicy::Factor(f) => {
                let f = if f.is_finite() { f.clamp(0.0, 1.0) } else { 0.0 };
                let spread = (ms as f64 * f) as u64;
                let low = ms.saturating_sub(spread);
                let high = ms.saturating_add(spread);
                rng.random_range(low..=high)
            }
        };
        Duration::from_millis(jittered).min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn test_none_is_exact() {
        let d = Duration::from_millis(750);
        assert_eq!(JitterPolicy::None.apply(d, MAX), d);
        assert_eq!(JitterPolicy::None.apply(d, Duration::from_millis(10)), Duration::from_millis(10));
    }

    #[test]
    fn test_bounds_hold() {
        let d = Duration::from_millis(1000);
        for _ in 0..200 {
            assert!(JitterPolicy::Full.apply(d, MAX) <= d);

            let eq = JitterPolicy::Equal.apply(d, MAX);
            assert!(eq >= Duration::from_millis(500) && eq <= d);

            let f = JitterPolicy::Factor(0.5).apply(d, MAX);
            assert!(f >= Duration::from_millis(500) && f <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_factor_respects_max_and_bad_input() {
        let d = Duration::from_millis(1000);
        assert!(JitterPolicy::Factor(1.0).apply(d, d) <= d);
        assert_eq!(JitterPolicy::Factor(f64::NAN).apply(d, MAX), d);
        assert_eq!(JitterPolicy::Full.apply(Duration::ZERO, MAX), Duration::ZERO);
    }
}
