//! # Timed operators.
//!
//! Every operator here schedules on the subscription's timer: the virtual
//! clock when one is installed in the context (see
//! [`StepVerifier::with_virtual_time`](crate::testing::StepVerifier::with_virtual_time)),
//! otherwise the shared parallel scheduler.
//!
//! ## Rules
//! - Cancelling a subscription cancels its pending timer.
//! - `interval` never buffers ticks: a tick without demand terminates the
//!   sequence with [`FluxError::Overflow`].
//! - `timeout` measures the gap before the first item and between items.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::error_ops::Forward;
use super::scalar::{Outcome, ScalarEmitter};
use super::{Flux, Item};
use crate::context::Context;
use crate::error::FluxError;
use crate::protocol::{
    add_demand, produced, BoxSubscriber, Signal, Subscriber, Subscription, SubscriptionArbiter,
    SubscriptionRef, WorkInProgress,
};
use crate::scheduler::{timer_for, SchedulerRef, TaskHandle};

/// Emits `value` after `delay`, once per subscription.
fn delayed_value<T: Item>(value: T, delay: Duration) -> Flux<T> {
    let slot = Arc::new(Mutex::new(Some(value)));
    Flux::from_fn(move |sub, cx| {
        let emitter = ScalarEmitter::new();
        emitter.start(sub);
        if emitter.is_cancelled() {
            return;
        }
        let (slot, fire) = (Arc::clone(&slot), Arc::clone(&emitter));
        let scheduled = timer_for(&cx).schedule_after(
            delay,
            Box::new(move || match slot.lock().take() {
                Some(v) => fire.complete(Outcome::Value(v)),
                None => fire.complete(Outcome::Empty),
            }),
        );
        match scheduled {
            Ok(handle) => emitter.set_on_cancel(move || handle.cancel()),
            Err(e) => emitter.complete(Outcome::Error(e)),
        }
    })
}

struct IntervalState {
    downstream: Mutex<Option<BoxSubscriber<u64>>>,
    requested: AtomicU64,
    pending_ticks: AtomicU64,
    count: AtomicU64,
    armed: AtomicU64,
    cancelled: AtomicBool,
    wip: WorkInProgress,
    handle: Mutex<Option<TaskHandle>>,
    timer: SchedulerRef,
    period: Duration,
}

impl IntervalState {
    fn schedule(self: &Arc<Self>, delay: Duration) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let seq = self.armed.fetch_add(1, Ordering::AcqRel) + 1;
        let state = Arc::clone(self);
        let scheduled = self.timer.schedule_after(delay, Box::new(move || state.tick()));
        match scheduled {
            Ok(handle) => {
                // a zero delay may already have run the tick and armed the next one
                if self.armed.load(Ordering::Acquire) == seq {
                    *self.handle.lock() = Some(handle);
                }
                if self.cancelled.load(Ordering::Acquire) {
                    self.stop_timer();
                }
            }
            Err(e) => self.terminate(e),
        }
    }

    fn tick(self: &Arc<Self>) {
        self.pending_ticks.fetch_add(1, Ordering::AcqRel);
        self.wip.drain(|| self.drain_once());
        self.schedule(self.period);
    }

    fn stop_timer(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
    }

    fn terminate(&self, error: FluxError) {
        self.cancelled.store(true, Ordering::Release);
        self.stop_timer();
        let sub = self.downstream.lock().take();
        if let Some(mut sub) = sub {
            sub.on_signal(Signal::Error(error));
        }
    }

    fn drain_once(&self) {
        let mut guard = self.downstream.lock();
        if guard.is_none() {
            return;
        }
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                guard.take();
                return;
            }
            if self.pending_ticks.load(Ordering::Acquire) == 0 {
                return;
            }
            self.pending_ticks.fetch_sub(1, Ordering::AcqRel);
            let tick = self.count.fetch_add(1, Ordering::AcqRel);
            if self.requested.load(Ordering::Acquire) == 0 {
                self.cancelled.store(true, Ordering::Release);
                self.stop_timer();
                let sub = guard.take();
                drop(guard);
                if let Some(mut sub) = sub {
                    sub.on_signal(Signal::Error(FluxError::overflow(format!(
                        "could not emit tick {tick} due to lack of requests"
                    ))));
                }
                return;
            }
            produced(&self.requested, 1);
            if let Some(sub) = guard.as_mut() {
                sub.on_signal(Signal::Next(tick));
            }
        }
    }
}

impl Subscription for IntervalState {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        add_demand(&self.requested, n);
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_timer();
        self.wip.drain(|| self.drain_once());
    }
}

impl Flux<u64> {
    /// Emits `0` after `delay`, then completes.
    pub fn timer(delay: Duration) -> Flux<u64> {
        // one value slot per subscription
        Flux::defer(move || delayed_value(0, delay))
    }

    /// Emits `0, 1, 2, …` every `period`, starting one period from now.
    pub fn interval(period: Duration) -> Flux<u64> {
        Flux::interval_with_delay(period, period)
    }

    /// Emits `0` after `delay`, then the following ticks every `period`.
    ///
    /// ```
    /// use std::time::Duration;
    /// use rivulet::Flux;
    /// use rivulet::testing::StepVerifier;
    ///
    /// StepVerifier::with_virtual_time(|| Flux::interval(Duration::from_secs(60)).take(2))
    ///     .expect_subscription()
    ///     .then_await(Duration::from_secs(120))
    ///     .expect_next_sequence([0, 1])
    ///     .verify_complete()
    ///     .unwrap();
    /// ```
    pub fn interval_with_delay(delay: Duration, period: Duration) -> Flux<u64> {
        Flux::from_fn(move |mut sub, cx| {
            let state = Arc::new(IntervalState {
                downstream: Mutex::new(None),
                requested: AtomicU64::new(0),
                pending_ticks: AtomicU64::new(0),
                count: AtomicU64::new(0),
                armed: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                wip: WorkInProgress::new(),
                handle: Mutex::new(None),
                timer: timer_for(&cx),
                period,
            });
            sub.on_subscribe(state.clone());
            *state.downstream.lock() = Some(sub);
            state.schedule(delay);
        })
    }
}

struct DelayedSubscription {
    arbiter: Arc<SubscriptionArbiter>,
    handle: Mutex<Option<TaskHandle>>,
}

impl Subscription for DelayedSubscription {
    fn request(&self, n: u64) {
        self.arbiter.request(n);
    }

    fn cancel(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
        self.arbiter.cancel();
    }
}

struct TimeoutState<T> {
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    upstream: Mutex<Option<SubscriptionRef>>,
    handle: Mutex<Option<TaskHandle>>,
    generation: AtomicU64,
    done: AtomicBool,
    timer: SchedulerRef,
    timeout: Duration,
}

impl<T: Item> TimeoutState<T> {
    fn arm(self: &Arc<Self>, generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let scheduled = self.timer.schedule_after(
            self.timeout,
            Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.fire(generation);
                }
            }),
        );
        match scheduled {
            Ok(handle) => {
                let previous = self.handle.lock().replace(handle);
                if let Some(previous) = previous {
                    previous.cancel();
                }
            }
            Err(e) => self.finish(Signal::Error(e)),
        }
    }

    fn fire(&self, generation: u64) {
        let sub = {
            let mut guard = self.downstream.lock();
            if self.done.load(Ordering::Acquire) || self.generation.load(Ordering::Acquire) != generation {
                return;
            }
            self.done.store(true, Ordering::Release);
            guard.take()
        };
        tracing::debug!(timeout = ?self.timeout, "no item within timeout");
        let upstream = self.upstream.lock().take();
        if let Some(up) = upstream {
            up.cancel();
        }
        if let Some(mut sub) = sub {
            sub.on_signal(Signal::Error(FluxError::Timeout {
                timeout: self.timeout,
            }));
        }
    }

    fn finish(&self, terminal: Signal<T>) {
        let sub = {
            let mut guard = self.downstream.lock();
            if self.done.swap(true, Ordering::AcqRel) {
                return;
            }
            guard.take()
        };
        if let Some(handle) = self.handle.lock().take() {
            handle.cancel();
        }
        if let Some(mut sub) = sub {
            sub.on_signal(terminal);
        }
    }
}

struct TimeoutSubscription<T> {
    state: Arc<TimeoutState<T>>,
}

impl<T: Item> Subscription for TimeoutSubscription<T> {
    fn request(&self, n: u64) {
        let upstream = self.state.upstream.lock().clone();
        if let Some(up) = upstream {
            up.request(n);
        }
    }

    fn cancel(&self) {
        self.state.done.store(true, Ordering::Release);
        if let Some(handle) = self.state.handle.lock().take() {
            handle.cancel();
        }
        let upstream = self.state.upstream.lock().take();
        if let Some(up) = upstream {
            up.cancel();
        }
    }
}

struct TimeoutSubscriber<T> {
    state: Arc<TimeoutState<T>>,
}

impl<T: Item> Subscriber<T> for TimeoutSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        *self.state.upstream.lock() = Some(subscription);
        let downstream = Arc::new(TimeoutSubscription {
            state: Arc::clone(&self.state),
        });
        let sub = self.state.downstream.lock().take();
        if let Some(mut sub) = sub {
            sub.on_subscribe(downstream);
            *self.state.downstream.lock() = Some(sub);
        }
        if !self.state.done.load(Ordering::Acquire) {
            self.state.arm(0);
        }
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(v) => {
                let generation = {
                    let mut guard = self.state.downstream.lock();
                    if self.state.done.load(Ordering::Acquire) {
                        return;
                    }
                    let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    if let Some(sub) = guard.as_mut() {
                        sub.on_signal(Signal::Next(v));
                    }
                    generation
                };
                if !self.state.done.load(Ordering::Acquire) {
                    self.state.arm(generation);
                }
            }
            terminal => self.state.finish(terminal),
        }
    }
}

impl<T: Item> Flux<T> {
    /// Delays each item by `delay`; items keep their order and spacing is
    /// at least `delay`.
    pub fn delay_elements(self, delay: Duration) -> Flux<T> {
        self.concat_map(move |v| delayed_value(v, delay))
    }

    /// Subscribes to this flux only after `delay`.
    pub fn delay_subscription(self, delay: Duration) -> Flux<T> {
        Flux::from_fn(move |mut sub, cx: Context| {
            let arbiter = Arc::new(SubscriptionArbiter::new());
            let subscription = Arc::new(DelayedSubscription {
                arbiter: Arc::clone(&arbiter),
                handle: Mutex::new(None),
            });
            sub.on_subscribe(subscription.clone());
            let slot = Arc::new(Mutex::new(Some(sub)));
            let (source, pending, timer_cx) = (self.clone(), Arc::clone(&slot), cx.clone());
            let task_arbiter = Arc::clone(&arbiter);
            let scheduled = timer_for(&cx).schedule_after(
                delay,
                Box::new(move || {
                    let Some(sub) = pending.lock().take() else {
                        return;
                    };
                    if task_arbiter.is_cancelled() {
                        return;
                    }
                    source.subscribe_inner(Box::new(Forward::new(sub, task_arbiter)), timer_cx);
                }),
            );
            match scheduled {
                Ok(handle) => *subscription.handle.lock() = Some(handle),
                Err(e) => {
                    if let Some(mut sub) = slot.lock().take() {
                        sub.on_signal(Signal::Error(e));
                    }
                }
            }
        })
    }

    /// Fails with [`FluxError::Timeout`] if no item arrives within
    /// `timeout` of subscription or of the previous item.
    pub fn timeout(self, timeout: Duration) -> Flux<T> {
        Flux::from_fn(move |sub, cx| {
            let state = Arc::new(TimeoutState {
                downstream: Mutex::new(Some(sub)),
                upstream: Mutex::new(None),
                handle: Mutex::new(None),
                generation: AtomicU64::new(0),
                done: AtomicBool::new(false),
                timer: timer_for(&cx),
                timeout,
            });
            self.subscribe_inner(Box::new(TimeoutSubscriber { state }), cx);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PublisherProbe, StepVerifier};

    #[test]
    fn test_timer_fires_after_delay() {
        StepVerifier::with_virtual_time(|| Flux::timer(Duration::from_secs(10)))
            .expect_subscription()
            .expect_no_event(Duration::from_secs(10))
            .expect_next(0)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_interval_without_demand_overflows() {
        StepVerifier::with_virtual_time_and_demand(|| Flux::interval(Duration::from_secs(1)), 1)
            .then_await(Duration::from_secs(1))
            .expect_next(0)
            .then_await(Duration::from_secs(1))
            .expect_error_matches(|e| e.as_label() == "flux_overflow")
            .verify()
            .unwrap();
    }

    #[test]
    fn test_delay_elements_spacing() {
        StepVerifier::with_virtual_time(|| Flux::range(1, 3).delay_elements(Duration::from_secs(5)))
            .expect_subscription()
            .expect_no_event(Duration::from_secs(5))
            .expect_next(1)
            .expect_no_event(Duration::from_secs(5))
            .expect_next(2)
            .then_await(Duration::from_secs(5))
            .expect_next(3)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_delay_subscription_defers_upstream() {
        let probe = PublisherProbe::of(Flux::range(0, 2));
        let p = probe.clone();
        StepVerifier::with_virtual_time(move || p.flux().delay_subscription(Duration::from_secs(3)))
            .expect_subscription()
            .expect_no_event(Duration::from_secs(3))
            .expect_next_sequence([0, 1])
            .verify_complete()
            .unwrap();
        probe.assert_was_subscribed();
    }

    #[test]
    fn test_timeout_between_items() {
        StepVerifier::with_virtual_time(|| {
            Flux::concat(vec![Flux::just(1), Flux::<i32>::never()]).timeout(Duration::from_secs(2))
        })
        .expect_next(1)
        .then_await(Duration::from_secs(2))
        .expect_timeout()
        .verify()
        .unwrap();
    }

    #[test]
    fn test_timeout_not_triggered_by_fast_source() {
        StepVerifier::with_virtual_time(|| {
            Flux::range(0, 3).delay_elements(Duration::from_secs(1)).timeout(Duration::from_secs(2))
        })
        .then_await(Duration::from_secs(3))
        .expect_next_sequence([0, 1, 2])
        .verify_complete()
        .unwrap();
    }

    #[test]
    fn test_cancel_releases_timer() {
        StepVerifier::with_virtual_time(|| Flux::timer(Duration::from_secs(60)))
            .expect_subscription()
            .then_cancel()
            .verify_then_assert_that()
            .unwrap()
            .has_not_dropped_elements();
    }
}
