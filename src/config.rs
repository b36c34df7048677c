//! # Engine configuration.
//!
//! Provides [`Config`], the centralized defaults used by operators, schedulers
//! and the test harness.
//!
//! Config is used in three ways:
//! 1. **Operator defaults**: `prefetch` and `flat_map_concurrency` when no explicit value is given
//! 2. **Scheduler creation**: [`Schedulers::from_config`](crate::Schedulers::from_config)
//! 3. **Verifier options**: [`StepVerifierOptions::from_config`](crate::testing::StepVerifierOptions::from_config)
//!
//! ## Sentinel values
//! - `flat_map_concurrency = 0` → unbounded
//! - `parallelism = 0` → number of available cores
//! - `bounded_elastic_cap = 0` → 10 × available cores
//! - `verify_timeout = 0s` / `block_timeout = 0s` → wait forever

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::AssemblyError;

/// Default inner prefetch for `flat_map` and queue size for `publish_on`.
pub const DEFAULT_PREFETCH: usize = 32;

/// Global configuration for the engine.
///
/// ## Field semantics
/// - `prefetch`: Items requested ahead by queueing operators (min 1)
/// - `flat_map_concurrency`: Inner subscriptions active at once (`0` = unbounded)
/// - `parallelism`: Worker lanes of the parallel scheduler (`0` = cores)
/// - `bounded_elastic_cap`: Lane cap of the bounded-elastic scheduler (`0` = 10 × cores)
/// - `verify_timeout`: Max wall-clock wait per verifier step (`0s` = forever)
/// - `block_timeout`: Default timeout for blocking adapters (`0s` = none)
///
/// ## Notes
/// All fields are public. Prefer the accessors to sprinkling sentinel checks
/// (`0`) across the codebase.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of items queueing operators request ahead of consumption.
    pub prefetch: usize,

    /// Maximum concurrent inner subscriptions of `flat_map`.
    ///
    /// - `0` = unbounded
    /// - `n > 0` = at most `n` inner flows are subscribed at a time
    pub flat_map_concurrency: usize,

    /// Number of lanes of the parallel scheduler.
    pub parallelism: usize,

    /// Maximum number of lanes of the bounded-elastic scheduler.
    pub bounded_elastic_cap: usize,

    /// Maximum time a [`StepVerifier`](crate::testing::StepVerifier) waits for a signal.
    pub verify_timeout: Duration,

    /// Default timeout for `block_*` adapters.
    pub block_timeout: Duration,
}

impl Config {
    /// Returns a prefetch clamped to a minimum of 1.
    #[inline]
    pub fn prefetch_clamped(&self) -> usize {
        self.prefetch.max(1)
    }

    /// Returns the flat-map concurrency limit as an `Option`.
    ///
    /// - `None` → unbounded
    /// - `Some(n)` → at most `n` inner subscriptions
    #[inline]
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.flat_map_concurrency == 0 {
            None
        } else {
            Some(self.flat_map_concurrency)
        }
    }

    /// Returns the parallel scheduler size, resolving `0` to the core count.
    #[inline]
    pub fn parallelism_resolved(&self) -> usize {
        if self.parallelism == 0 {
            available_cores()
        } else {
            self.parallelism
        }
    }

    /// Returns the bounded-elastic lane cap, resolving `0` to 10 × cores.
    #[inline]
    pub fn bounded_elastic_cap_resolved(&self) -> usize {
        if self.bounded_elastic_cap == 0 {
            available_cores().saturating_mul(10)
        } else {
            self.bounded_elastic_cap
        }
    }

    /// Returns the verifier timeout as an `Option` (`None` = wait forever).
    #[inline]
    pub fn verify_timeout_opt(&self) -> Option<Duration> {
        if self.verify_timeout == Duration::ZERO {
            None
        } else {
            Some(self.verify_timeout)
        }
    }

    /// Returns the blocking-adapter timeout as an `Option`.
    #[inline]
    pub fn block_timeout_opt(&self) -> Option<Duration> {
        if self.block_timeout == Duration::ZERO {
            None
        } else {
            Some(self.block_timeout)
        }
    }

    /// Checks values that no sentinel can make sense of.
    ///
    /// Currently only `prefetch = 0` is rejected; it is otherwise clamped.
    pub fn validate(&self) -> Result<(), AssemblyError> {
        AssemblyError::positive("prefetch", self.prefetch)?;
        Ok(())
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `prefetch = 32`
    /// - `flat_map_concurrency = 0` (unbounded)
    /// - `parallelism = 0` (cores)
    /// - `bounded_elastic_cap = 0` (10 × cores)
    /// - `verify_timeout = 10s`
    /// - `block_timeout = 0s` (none)
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            flat_map_concurrency: 0,
            parallelism: 0,
            bounded_elastic_cap: 0,
            verify_timeout: Duration::from_secs(10),
            block_timeout: Duration::ZERO,
        }
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_resolve() {
        let cfg = Config::default();
        assert_eq!(cfg.concurrency_limit(), None);
        assert!(cfg.parallelism_resolved() >= 1);
        assert_eq!(
            cfg.bounded_elastic_cap_resolved(),
            cfg.parallelism_resolved() * 10
        );
        assert_eq!(cfg.verify_timeout_opt(), Some(Duration::from_secs(10)));
        assert_eq!(cfg.block_timeout_opt(), None);
    }

    #[test]
    fn test_prefetch_clamped_and_validated() {
        let cfg = Config {
            prefetch: 0,
            ..Config::default()
        };
        assert_eq!(cfg.prefetch_clamped(), 1);
        assert!(cfg.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
