//! # Switching to the latest inner sequence.
//!
//! Each outer item starts a new inner flux; the previous inner is cancelled
//! at once, whether or not it completed. Items are tagged with the
//! generation of the inner that produced them so late items of a cancelled
//! inner are discarded.
//!
//! ```text
//! outer:   a ─────── b ──────────── |
//! inner a: a1 a2 ✗ (cancelled when b arrives)
//! inner b:           b1 b2 b3 |
//! output:  a1 a2     b1 b2 b3 |   (complete after outer and last inner)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Flux, Item};
use crate::config::Config;
use crate::context::Context;
use crate::error::FluxError;
use crate::hooks;
use crate::protocol::{
    add_demand, produced, BoxSubscriber, Signal, Subscriber, Subscription, SubscriptionRef,
    WorkInProgress, UNBOUNDED,
};

type Mapper<T, U> = dyn Fn(T) -> Flux<U> + Send + Sync;

struct CurrentInner {
    generation: u64,
    subscription: Option<SubscriptionRef>,
    consumed: u64,
}

struct SwitchState<T, U> {
    downstream: Mutex<Option<BoxSubscriber<U>>>,
    upstream: Mutex<Option<SubscriptionRef>>,
    current: Mutex<Option<CurrentInner>>,
    queue: Mutex<VecDeque<(u64, U)>>,
    error: Mutex<Option<FluxError>>,
    generation: AtomicU64,
    requested: AtomicU64,
    outer_done: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    wip: WorkInProgress,
    mapper: Arc<Mapper<T, U>>,
    prefetch: u64,
    limit: u64,
    cx: Context,
}

impl<T: Item, U: Item> SwitchState<T, U> {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn fail(&self, error: FluxError) {
        {
            let mut slot = self.error.lock();
            if slot.is_some() || self.terminated.load(Ordering::Acquire) {
                drop(slot);
                hooks::on_error_dropped(error, &self.cx);
                return;
            }
            *slot = Some(error);
        }
        self.wip.drain(|| self.drain_once());
    }

    fn cancel_sources(&self) {
        let upstream = self.upstream.lock().take();
        let inner = self.current.lock().take().and_then(|c| c.subscription);
        if let Some(up) = upstream {
            up.cancel();
        }
        if let Some(inner) = inner {
            inner.cancel();
        }
    }

    fn replenish(&self, generation: u64) -> Option<(SubscriptionRef, u64)> {
        let mut current = self.current.lock();
        let inner = current.as_mut().filter(|c| c.generation == generation)?;
        inner.consumed += 1;
        if inner.consumed < self.limit {
            return None;
        }
        let n = std::mem::take(&mut inner.consumed);
        inner.subscription.clone().map(|s| (s, n))
    }

    fn drain_once(&self) {
        let mut guard = self.downstream.lock();
        if guard.is_none() {
            return;
        }
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                guard.take();
                self.queue.lock().clear();
                return;
            }
            if let Some(error) = self.error.lock().take() {
                self.terminated.store(true, Ordering::Release);
                self.queue.lock().clear();
                let sub = guard.take();
                drop(guard);
                self.cancel_sources();
                if let Some(mut sub) = sub {
                    sub.on_signal(Signal::Error(error));
                }
                return;
            }
            let next = {
                let latest = self.generation.load(Ordering::Acquire);
                let mut queue = self.queue.lock();
                while queue.front().is_some_and(|(g, _)| *g != latest) {
                    queue.pop_front();
                }
                if self.requested.load(Ordering::Acquire) > 0 {
                    queue.pop_front()
                } else {
                    None
                }
            };
            if let Some((generation, value)) = next {
                produced(&self.requested, 1);
                if let Some(sub) = guard.as_mut() {
                    sub.on_signal(Signal::Next(value));
                }
                if let Some((inner, n)) = self.replenish(generation) {
                    inner.request(n);
                }
                continue;
            }
            let finished = self.outer_done.load(Ordering::Acquire)
                && self.current.lock().is_none()
                && self.queue.lock().is_empty();
            if finished {
                self.terminated.store(true, Ordering::Release);
                if let Some(mut sub) = guard.take() {
                    drop(guard);
                    sub.on_signal(Signal::Complete);
                }
            }
            return;
        }
    }
}

impl<T: Item, U: Item> Subscription for SwitchState<T, U> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        add_demand(&self.requested, n);
        self.wip.drain(|| self.drain_once());
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_sources();
        self.wip.drain(|| self.drain_once());
    }
}

struct OuterSubscriber<T, U> {
    state: Arc<SwitchState<T, U>>,
}

impl<T: Item, U: Item> Subscriber<T> for OuterSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        *self.state.upstream.lock() = Some(Arc::clone(&subscription));
        if self.state.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        subscription.request(UNBOUNDED);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let state = &self.state;
        match signal {
            Signal::Next(value) => {
                if state.cancelled.load(Ordering::Acquire) || state.terminated.load(Ordering::Acquire) {
                    return;
                }
                // Bump the generation while holding `current` so a late
                // terminal from the previous inner sees the new slot.
                let (generation, previous) = {
                    let mut current = state.current.lock();
                    let generation = state.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    let previous = current.replace(CurrentInner {
                        generation,
                        subscription: None,
                        consumed: 0,
                    });
                    (generation, previous)
                };
                if let Some(previous) = previous.and_then(|p| p.subscription) {
                    tracing::trace!(generation, "switching inner");
                    previous.cancel();
                }
                let inner = (state.mapper)(value);
                let subscriber = InnerSubscriber {
                    state: Arc::clone(state),
                    generation,
                };
                inner.subscribe_inner(Box::new(subscriber), state.cx.clone());
            }
            Signal::Error(e) => state.fail(e),
            Signal::Complete => {
                state.outer_done.store(true, Ordering::Release);
                state.wip.drain(|| state.drain_once());
            }
        }
    }
}

struct InnerSubscriber<T, U> {
    state: Arc<SwitchState<T, U>>,
    generation: u64,
}

impl<T: Item, U: Item> Subscriber<U> for InnerSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let registered = {
            let mut current = self.state.current.lock();
            match current.as_mut() {
                Some(c) if c.generation == self.generation => {
                    c.subscription = Some(Arc::clone(&subscription));
                    true
                }
                _ => false,
            }
        };
        if !registered || self.state.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        subscription.request(self.state.prefetch);
    }

    fn on_signal(&mut self, signal: Signal<U>) {
        let state = &self.state;
        if !state.is_current(self.generation) {
            return;
        }
        match signal {
            Signal::Next(value) => {
                state.queue.lock().push_back((self.generation, value));
                state.wip.drain(|| state.drain_once());
            }
            Signal::Error(e) => {
                if state.current.lock().as_ref().is_some_and(|c| c.generation == self.generation) {
                    state.fail(e);
                } else {
                    hooks::on_error_dropped(e, &state.cx);
                }
            }
            Signal::Complete => {
                let retired = {
                    let mut current = state.current.lock();
                    let matches = current.as_ref().is_some_and(|c| c.generation == self.generation);
                    if matches {
                        current.take();
                    }
                    matches
                };
                if retired {
                    state.wip.drain(|| state.drain_once());
                }
            }
        }
    }
}

impl<T: Item> Flux<T> {
    /// Maps each item to an inner flux, cancelling the previous inner as
    /// soon as a new item arrives.
    pub fn switch_map<U, F>(self, f: F) -> Flux<U>
    where
        U: Item,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        let mapper: Arc<Mapper<T, U>> = Arc::new(f);
        let prefetch = Config::default().prefetch_clamped() as u64;
        Flux::from_fn(move |mut sub, cx: Context| {
            let state = Arc::new(SwitchState {
                downstream: Mutex::new(None),
                upstream: Mutex::new(None),
                current: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                error: Mutex::new(None),
                generation: AtomicU64::new(0),
                requested: AtomicU64::new(0),
                outer_done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                wip: WorkInProgress::new(),
                mapper: Arc::clone(&mapper),
                prefetch,
                limit: (prefetch - prefetch / 4).max(1),
                cx: cx.clone(),
            });
            state.wip.enter();
            sub.on_subscribe(state.clone());
            *state.downstream.lock() = Some(sub);
            state.wip.run(|| state.drain_once());
            if state.cancelled.load(Ordering::Acquire) {
                return;
            }
            self.subscribe_inner(Box::new(OuterSubscriber { state }), cx);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EmptySubscription;
    use crate::testing::{PublisherProbe, StepVerifier, TestPublisher};
    use std::time::Duration;

    #[test]
    fn test_new_item_cancels_previous_inner() {
        let outer = TestPublisher::<u8>::create();
        let slow = PublisherProbe::of(Flux::<&'static str>::never());
        let (driver, s) = (outer.clone(), slow.clone());
        let flux = outer.flux().switch_map(move |v| match v {
            1 => s.flux(),
            _ => Flux::just("fast"),
        });
        StepVerifier::create(flux)
            .then(move || {
                driver.next(1);
                driver.next(2);
                driver.complete();
            })
            .expect_next("fast")
            .verify_complete()
            .unwrap();
        slow.assert_was_subscribed();
        slow.assert_was_cancelled();
    }

    #[test]
    fn test_completes_after_last_inner() {
        StepVerifier::with_virtual_time(|| {
            Flux::from_iter(vec![1_u64, 2])
                .switch_map(|v| Flux::just(v * 100).delay_elements(Duration::from_secs(v)))
        })
        .expect_subscription()
        .expect_no_event(Duration::from_secs(1))
        .then_await(Duration::from_secs(1))
        .expect_next(200)
        .verify_complete()
        .unwrap();
    }

    #[test]
    fn test_inner_error_terminates() {
        let flux = Flux::from_iter(vec![1, 2]).switch_map(|v| {
            if v == 2 {
                Flux::<i32>::error(FluxError::msg("inner"))
            } else {
                Flux::never()
            }
        });
        StepVerifier::create(flux).expect_error_message("inner").verify().unwrap();
    }

    #[test]
    fn test_stale_inner_completion_after_switch_is_ignored() {
        let outer = TestPublisher::<u8>::create();
        let second = TestPublisher::<&'static str>::create();
        let stale: Arc<Mutex<Option<BoxSubscriber<&'static str>>>> = Arc::new(Mutex::new(None));
        let first = {
            let stale = Arc::clone(&stale);
            Flux::from_fn(move |mut sub: BoxSubscriber<&'static str>, _cx: Context| {
                sub.on_subscribe(EmptySubscription::shared());
                *stale.lock() = Some(sub);
            })
        };
        let (driver, late, emitter) = (outer.clone(), Arc::clone(&stale), second.clone());
        let s2 = second.clone();
        let flux = outer.flux().switch_map(move |v| match v {
            1 => first.clone(),
            _ => s2.flux(),
        });
        StepVerifier::create(flux)
            .then(move || {
                driver.next(1);
                driver.next(2);
                driver.complete();
            })
            .then(move || {
                if let Some(mut sub) = late.lock().take() {
                    sub.on_signal(Signal::Complete);
                }
            })
            .expect_no_event(Duration::from_millis(50))
            .then(move || {
                emitter.next("second");
                emitter.complete();
            })
            .expect_next("second")
            .verify_complete()
            .unwrap();
        assert!(stale.lock().is_none());
        second.assert_was_subscribed();
    }
}
