//! # Instrumented source wrapper.
//!
//! [`PublisherProbe`] sits between a flux and its subscribers and counts
//! subscriptions, requests and cancellations. Assertions read the counters
//! after the run.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::flux::{Flux, Item};
use crate::protocol::add_demand;

#[derive(Default)]
struct ProbeState {
    subscriptions: AtomicUsize,
    requested: AtomicU64,
    request_calls: AtomicUsize,
    cancelled: AtomicBool,
}

/// Wraps a flux and records what its subscribers did with it.
///
/// ```
/// use rivulet::Flux;
/// use rivulet::testing::PublisherProbe;
///
/// let probe = PublisherProbe::of(Flux::range(0, 10));
/// assert_eq!(probe.flux().take(2).collect_blocking(None).unwrap(), vec![0, 1]);
/// probe.assert_was_subscribed();
/// probe.assert_was_cancelled();
/// ```
pub struct PublisherProbe<T> {
    source: Flux<T>,
    state: Arc<ProbeState>,
}

impl<T> Clone for PublisherProbe<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Item> PublisherProbe<T> {
    /// Probes `source`.
    pub fn of(source: Flux<T>) -> Self {
        Self {
            source,
            state: Arc::new(ProbeState::default()),
        }
    }

    /// The probed flux; every subscription to it is recorded.
    pub fn flux(&self) -> Flux<T> {
        let (s, r, c) = (self.state.clone(), self.state.clone(), self.state.clone());
        self.source
            .clone()
            .do_on_subscribe(move || {
                s.subscriptions.fetch_add(1, Ordering::AcqRel);
            })
            .do_on_request(move |n| {
                r.request_calls.fetch_add(1, Ordering::AcqRel);
                add_demand(&r.requested, n);
            })
            .do_on_cancel(move || c.cancelled.store(true, Ordering::Release))
    }

    /// Total demand requested over all subscriptions, saturating at
    /// [`UNBOUNDED`](crate::protocol::UNBOUNDED).
    pub fn total_requested(&self) -> u64 {
        self.state.requested.load(Ordering::Acquire)
    }

    /// Number of subscriptions made so far.
    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.load(Ordering::Acquire)
    }

    pub fn was_subscribed(&self) -> bool {
        self.subscription_count() > 0
    }

    pub fn was_requested(&self) -> bool {
        self.state.request_calls.load(Ordering::Acquire) > 0
    }

    pub fn was_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    #[track_caller]
    pub fn assert_was_subscribed(&self) {
        assert!(self.was_subscribed(), "expected the probe to be subscribed");
    }

    #[track_caller]
    pub fn assert_was_not_subscribed(&self) {
        assert!(
            !self.was_subscribed(),
            "expected no subscription, got {}",
            self.subscription_count()
        );
    }

    #[track_caller]
    pub fn assert_was_requested(&self) {
        assert!(self.was_requested(), "expected the probe to be requested");
    }

    #[track_caller]
    pub fn assert_was_cancelled(&self) {
        assert!(self.was_cancelled(), "expected the probe to be cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UNBOUNDED;
    use crate::testing::StepVerifier;

    #[test]
    fn test_records_demand() {
        let probe = PublisherProbe::of(Flux::range(0, 10));
        StepVerifier::create_with_demand(probe.flux(), 3)
            .expect_next_sequence([0, 1, 2])
            .then_request(UNBOUNDED)
            .expect_next_count(7)
            .verify_complete()
            .unwrap();
        assert_eq!(probe.total_requested(), UNBOUNDED);
        assert_eq!(probe.subscription_count(), 1);
        assert!(!probe.was_cancelled());
    }
}
