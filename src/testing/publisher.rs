//! # Manually driven publisher.
//!
//! ```text
//! test code ──next/error/complete──► TestPublisher ──► slot per subscriber ──► subscriber
//! ```
//!
//! ## Modes
//! - hot: subscribers see what is emitted while attached; an item without
//!   demand fails that subscriber with an overflow.
//! - cold: every subscriber replays the full history at its own pace.
//! - non-compliant: ignores demand and terminal-once, to exercise guards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::Context;
use crate::error::FluxError;
use crate::flux::{Flux, Item};
use crate::protocol::{add_demand, produced, BoxSubscriber, Signal, Subscription, WorkInProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Subscribers see what is emitted while they are subscribed; an item
    /// without demand fails that subscriber with an overflow.
    Hot,
    /// Every subscriber gets the full history, paced by its demand.
    Cold,
    /// Emits regardless of demand or prior termination.
    NonCompliant,
}

struct Slot<T> {
    id: u64,
    mode: Mode,
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    pending: Mutex<VecDeque<Signal<T>>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    wip: WorkInProgress,
    parent: Weak<Shared<T>>,
}

impl<T: Item + Clone> Slot<T> {
    fn offer(&self, signal: Signal<T>) {
        let signal = match signal {
            Signal::Next(_) if self.mode == Mode::Hot && self.requested.load(Ordering::Acquire) == 0 => {
                Signal::Error(FluxError::overflow("test publisher emitted without demand"))
            }
            other => other,
        };
        self.pending.lock().push_back(signal);
        self.drain();
    }

    fn drain(&self) {
        self.wip.drain(|| self.drain_once());
    }

    fn drain_once(&self) {
        let mode = self.mode;
        let mut guard = self.downstream.lock();
        if guard.is_none() {
            return;
        }
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                guard.take();
                self.pending.lock().clear();
                return;
            }
            let next = {
                let mut pending = self.pending.lock();
                let deliverable = match pending.front() {
                    Some(Signal::Next(_)) => {
                        mode == Mode::NonCompliant || self.requested.load(Ordering::Acquire) > 0
                    }
                    Some(_) => true,
                    None => false,
                };
                if deliverable {
                    pending.pop_front()
                } else {
                    None
                }
            };
            let Some(signal) = next else {
                return;
            };
            if matches!(signal, Signal::Next(_)) {
                produced(&self.requested, 1);
            } else if mode != Mode::NonCompliant {
                let sub = guard.take();
                drop(guard);
                self.detach();
                if let Some(mut sub) = sub {
                    sub.on_signal(signal);
                }
                return;
            }
            if let Some(sub) = guard.as_mut() {
                sub.on_signal(signal);
            }
        }
    }

    fn detach(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.slots.lock().retain(|s| s.id != self.id);
        }
    }
}

impl<T: Item + Clone> Subscription for Slot<T> {
    fn request(&self, n: u64) {
        add_demand(&self.requested, n);
        if let Some(parent) = self.parent.upgrade() {
            add_demand(&parent.total_requested, n);
            parent.request_calls.fetch_add(1, Ordering::AcqRel);
        }
        self.drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.cancelled.store(true, Ordering::Release);
            self.detach();
        }
        self.drain();
    }
}

struct Shared<T> {
    mode: Mode,
    slots: Mutex<Vec<Arc<Slot<T>>>>,
    history: Mutex<Vec<Signal<T>>>,
    terminated: AtomicBool,
    subscribed: AtomicBool,
    cancelled: AtomicBool,
    request_calls: AtomicU64,
    total_requested: AtomicU64,
    next_id: AtomicU64,
}

impl<T: Item + Clone> Shared<T> {
    fn attach(self: &Arc<Self>, mut sub: BoxSubscriber<T>) {
        self.subscribed.store(true, Ordering::Release);
        let slot = Arc::new(Slot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            mode: self.mode,
            downstream: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            wip: WorkInProgress::new(),
            parent: Arc::downgrade(self),
        });
        slot.wip.enter();
        sub.on_subscribe(slot.clone());
        *slot.downstream.lock() = Some(sub);
        {
            let history = self.history.lock();
            let mut pending = slot.pending.lock();
            match self.mode {
                Mode::Cold => pending.extend(history.iter().cloned()),
                _ => pending.extend(history.iter().filter(|s| s.is_terminal()).cloned()),
            }
            if !slot.cancelled.load(Ordering::Acquire) {
                self.slots.lock().push(Arc::clone(&slot));
            }
        }
        slot.wip.run(|| slot.drain_once());
    }

    fn emit(&self, signal: Signal<T>) {
        {
            let mut history = self.history.lock();
            if self.mode != Mode::NonCompliant && self.terminated.load(Ordering::Acquire) {
                tracing::debug!("test publisher signal ignored after termination");
                return;
            }
            if signal.is_terminal() {
                self.terminated.store(true, Ordering::Release);
            }
            if self.mode == Mode::Cold || signal.is_terminal() {
                history.push(signal.clone());
            }
        }
        let slots = self.slots.lock().clone();
        for slot in slots {
            slot.offer(signal.clone());
        }
    }
}

/// Manually driven publisher for tests.
///
/// ```
/// use rivulet::testing::TestPublisher;
///
/// let publisher = TestPublisher::<i32>::create();
/// let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
/// let s = seen.clone();
/// publisher.flux().subscribe(move |v| s.lock().unwrap().push(v));
/// publisher.next(1).next(2).complete();
/// assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
/// publisher.assert_no_subscribers();
/// ```
pub struct TestPublisher<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TestPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Item + Clone> TestPublisher<T> {
    fn with_mode(mode: Mode) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                slots: Mutex::new(Vec::new()),
                history: Mutex::new(Vec::new()),
                terminated: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                request_calls: AtomicU64::new(0),
                total_requested: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Hot publisher: late subscribers miss earlier items.
    pub fn create() -> Self {
        Self::with_mode(Mode::Hot)
    }

    /// Cold publisher: every subscriber replays the whole history.
    pub fn create_cold() -> Self {
        Self::with_mode(Mode::Cold)
    }

    /// Publisher that ignores demand and terminal-once; used to check that
    /// consumers guard themselves.
    pub fn create_noncompliant() -> Self {
        Self::with_mode(Mode::NonCompliant)
    }

    /// Flux subscribing to this publisher.
    pub fn flux(&self) -> Flux<T> {
        let shared = Arc::clone(&self.shared);
        Flux::from_fn(move |sub, _cx: Context| shared.attach(sub))
    }

    /// Emits `value` to every current subscriber.
    pub fn next(&self, value: T) -> &Self {
        self.shared.emit(Signal::Next(value));
        self
    }

    /// Emits several values in order.
    pub fn emit(&self, values: impl IntoIterator<Item = T>) -> &Self {
        for v in values {
            self.next(v);
        }
        self
    }

    /// Terminates every subscriber with `error`.
    pub fn error(&self, error: FluxError) {
        self.shared.emit(Signal::Error(error));
    }

    /// Completes every subscriber.
    pub fn complete(&self) {
        self.shared.emit(Signal::Complete);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.slots.lock().len()
    }

    #[track_caller]
    pub fn assert_was_subscribed(&self) -> &Self {
        assert!(
            self.shared.subscribed.load(Ordering::Acquire),
            "expected the publisher to be subscribed"
        );
        self
    }

    #[track_caller]
    pub fn assert_was_requested(&self) -> &Self {
        assert!(
            self.shared.request_calls.load(Ordering::Acquire) > 0,
            "expected the publisher to be requested"
        );
        self
    }

    /// Asserts that every live subscriber has at least `n` outstanding demand.
    #[track_caller]
    pub fn assert_min_requested(&self, n: u64) -> &Self {
        let slots = self.shared.slots.lock().clone();
        assert!(!slots.is_empty(), "expected at least one subscriber");
        let min = slots
            .iter()
            .map(|s| s.requested.load(Ordering::Acquire))
            .min()
            .unwrap_or(0);
        assert!(min >= n, "expected at least {n} requested, got {min}");
        self
    }

    #[track_caller]
    pub fn assert_was_cancelled(&self) -> &Self {
        assert!(
            self.shared.cancelled.load(Ordering::Acquire),
            "expected a subscriber to cancel"
        );
        self
    }

    #[track_caller]
    pub fn assert_no_subscribers(&self) -> &Self {
        let count = self.subscriber_count();
        assert_eq!(count, 0, "expected no subscribers, got {count}");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StepVerifier;

    #[test]
    fn test_hot_overflow_without_demand() {
        let publisher = TestPublisher::<i32>::create();
        let driver = publisher.clone();
        StepVerifier::create_with_demand(publisher.flux(), 1)
            .then(move || {
                driver.next(1).next(2);
            })
            .expect_next(1)
            .expect_error_matches(|e| e.as_label() == "flux_overflow")
            .verify()
            .unwrap();
        publisher.assert_no_subscribers();
    }

    #[test]
    fn test_cold_replays_history_with_demand() {
        let publisher = TestPublisher::<&'static str>::create_cold();
        publisher.emit(["a", "b", "c"]).complete();
        StepVerifier::create_with_demand(publisher.flux(), 2)
            .expect_next_sequence(["a", "b"])
            .expect_no_event(std::time::Duration::from_millis(10))
            .then_request(1)
            .expect_next("c")
            .verify_complete()
            .unwrap();
        StepVerifier::create(publisher.flux())
            .expect_next_count(3)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_noncompliant_is_caught_at_the_boundary() {
        let publisher = TestPublisher::<i32>::create_noncompliant();
        let driver = publisher.clone();
        StepVerifier::create_with_demand(publisher.flux(), 1)
            .then(move || {
                driver.next(1).next(2);
                driver.complete();
            })
            .expect_next(1)
            .expect_error_matches(|e| e.is_fatal())
            .verify_then_assert_that()
            .unwrap()
            .has_dropped([2]);
    }
}
