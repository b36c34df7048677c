//! # Demand and cancellation control path.
//!
//! A [`Subscription`] binds one producer to one consumer. Demand is a `u64`
//! counter that saturates at [`UNBOUNDED`]; once a subscription reaches it,
//! it is never decremented again.
//!
//! ## Rules
//! - `request(n)` adds `n ≥ 1` to demand; `request` and `cancel` may be called
//!   from any thread, including from inside `on_signal` (re-entrant).
//! - `cancel()` is idempotent. Signals already in flight are not retracted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Demand value meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

/// Control handle passed to a subscriber in `on_subscribe`.
pub trait Subscription: Send + Sync + 'static {
    /// Grants `n` more items.
    fn request(&self, n: u64);
    /// Stops the flow of items; idempotent.
    fn cancel(&self);
}

/// Shared handle to a subscription.
pub type SubscriptionRef = Arc<dyn Subscription>;

/// Adds `n` to `current` saturating at [`UNBOUNDED`]; returns the previous value.
pub fn add_demand(current: &AtomicU64, n: u64) -> u64 {
    let mut prev = current.load(Ordering::Acquire);
    loop {
        if prev == UNBOUNDED {
            return UNBOUNDED;
        }
        let next = prev.saturating_add(n);
        match current.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return prev,
            Err(actual) => prev = actual,
        }
    }
}

/// Subtracts `n` emitted items from `current` unless it is [`UNBOUNDED`];
/// returns the remaining demand.
pub fn produced(current: &AtomicU64, n: u64) -> u64 {
    let mut prev = current.load(Ordering::Acquire);
    loop {
        if prev == UNBOUNDED {
            return UNBOUNDED;
        }
        let next = prev.saturating_sub(n);
        match current.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Subscription that does nothing; handed out by sources that terminate
/// immediately.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EmptySubscription;

impl EmptySubscription {
    pub(crate) fn shared() -> SubscriptionRef {
        Arc::new(EmptySubscription)
    }
}

impl Subscription for EmptySubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

struct ArbiterState {
    current: Option<SubscriptionRef>,
    requested: u64,
    cancelled: bool,
}

/// Subscription that can switch its upstream while keeping the outstanding
/// demand of the downstream.
///
/// Used by operators that resubscribe (`retry`) or replace their source
/// (`on_error_resume`, `switch_if_empty`). The lock is never held while
/// calling into another subscription.
pub(crate) struct SubscriptionArbiter {
    state: Mutex<ArbiterState>,
}

impl SubscriptionArbiter {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ArbiterState {
                current: None,
                requested: 0,
                cancelled: false,
            }),
        }
    }

    /// Installs a new upstream and forwards the outstanding demand to it.
    pub(crate) fn set(&self, subscription: SubscriptionRef) {
        let outstanding = {
            let mut st = self.state.lock();
            if st.cancelled {
                None
            } else {
                st.current = Some(Arc::clone(&subscription));
                Some(st.requested)
            }
        };
        match outstanding {
            None => subscription.cancel(),
            Some(0) => {}
            Some(n) => subscription.request(n),
        }
    }

    /// Records `n` items delivered downstream.
    pub(crate) fn produced(&self, n: u64) {
        let mut st = self.state.lock();
        if st.requested != UNBOUNDED {
            st.requested = st.requested.saturating_sub(n);
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

impl Subscription for SubscriptionArbiter {
    fn request(&self, n: u64) {
        let current = {
            let mut st = self.state.lock();
            if st.cancelled {
                return;
            }
            st.requested = st.requested.saturating_add(n);
            st.current.clone()
        };
        if let Some(s) = current {
            s.request(n);
        }
    }

    fn cancel(&self) {
        let current = {
            let mut st = self.state.lock();
            st.cancelled = true;
            st.current.take()
        };
        if let Some(s) = current {
            s.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        requested: AtomicU64,
        cancelled: AtomicBool,
    }

    impl Subscription for Recorder {
        fn request(&self, n: u64) {
            add_demand(&self.requested, n);
        }
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_demand_saturates() {
        let d = AtomicU64::new(5);
        assert_eq!(add_demand(&d, u64::MAX - 1), 5);
        assert_eq!(d.load(Ordering::SeqCst), UNBOUNDED);
        assert_eq!(produced(&d, 3), UNBOUNDED);

        let d = AtomicU64::new(5);
        assert_eq!(produced(&d, 3), 2);
        assert_eq!(produced(&d, 7), 0);
    }

    #[test]
    fn test_arbiter_carries_outstanding_demand() {
        let arbiter = SubscriptionArbiter::new();
        let first = Arc::new(Recorder::default());
        arbiter.set(first.clone());
        arbiter.request(10);
        arbiter.produced(4);
        assert_eq!(first.requested.load(Ordering::SeqCst), 10);

        let second = Arc::new(Recorder::default());
        arbiter.set(second.clone());
        assert_eq!(second.requested.load(Ordering::SeqCst), 6);

        arbiter.cancel();
        assert!(second.cancelled.load(Ordering::SeqCst));
        assert!(arbiter.is_cancelled());

        let third = Arc::new(Recorder::default());
        arbiter.set(third.clone());
        assert!(third.cancelled.load(Ordering::SeqCst));
    }
}
