//! # Item-level operators.
//!
//! | operator | demand upstream |
//! |---|---|
//! | `map`, `scan` | unchanged (1:1) |
//! | `filter`, `skip`, `try_filter` | unchanged, plus `request(1)` per dropped item |
//! | `try_map` | unchanged, plus `request(1)` per item dropped by `on_error_continue` |
//! | `take(n)` | capped at `n` in total |
//! | `take_while` | unchanged; cancels at the first rejected item |
//! | `skip_while` | unchanged, plus `request(1)` per skipped item |
//! | `switch_if_empty` | outstanding demand carried over to the alternative |

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::error_ops::{ErrorStrategy, Forward};
use super::{Flux, Item};
use crate::context::Context;
use crate::error::{BoxError, FluxError};
use crate::hooks;
use crate::protocol::{
    BoxSubscriber, EmptySubscription, Signal, Subscriber, Subscription, SubscriptionArbiter,
    SubscriptionRef,
};

struct MapSubscriber<U, F> {
    actual: BoxSubscriber<U>,
    f: Arc<F>,
}

impl<T, U, F> Subscriber<T> for MapSubscriber<U, F>
where
    T: Item,
    U: Item,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.actual.on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let f = &self.f;
        self.actual.on_signal(signal.map(|v| f(v)));
    }
}

struct FilterSubscriber<T, P> {
    actual: BoxSubscriber<T>,
    predicate: Arc<P>,
    upstream: Option<SubscriptionRef>,
}

impl<T, P> Subscriber<T> for FilterSubscriber<T, P>
where
    T: Item,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(Arc::clone(&subscription));
        self.actual.on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(v) if !(self.predicate)(&v) => {
                if let Some(up) = &self.upstream {
                    up.request(1);
                }
            }
            other => self.actual.on_signal(other),
        }
    }
}

/// Fallible item step shared by `try_map` and `try_filter`.
type TryStep<T, U> = dyn Fn(&T) -> Result<Option<U>, FluxError> + Send + Sync;

struct TrySubscriber<T, U> {
    actual: BoxSubscriber<U>,
    step: Arc<TryStep<T, U>>,
    strategy: ErrorStrategy,
    upstream: Option<SubscriptionRef>,
    done: bool,
    cx: Context,
}

impl<T: Item, U: Item> TrySubscriber<T, U> {
    fn fail(&mut self, error: FluxError) {
        self.done = true;
        if let Some(up) = &self.upstream {
            up.cancel();
        }
        self.actual.on_signal(Signal::Error(error));
    }

    fn request_one(&self) {
        if let Some(up) = &self.upstream {
            up.request(1);
        }
    }
}

impl<T: Item, U: Item> Subscriber<T> for TrySubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(Arc::clone(&subscription));
        self.actual.on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        if self.done {
            match signal {
                Signal::Next(v) => hooks::on_next_dropped(v, &self.cx),
                Signal::Error(e) => hooks::on_error_dropped(e, &self.cx),
                Signal::Complete => {}
            }
            return;
        }
        let value = match signal {
            Signal::Next(v) => v,
            Signal::Error(e) => {
                self.done = true;
                self.actual.on_signal(Signal::Error(e));
                return;
            }
            Signal::Complete => {
                self.done = true;
                self.actual.on_signal(Signal::Complete);
                return;
            }
        };
        match (self.step)(&value) {
            Ok(Some(out)) => self.actual.on_signal(Signal::Next(out)),
            Ok(None) => self.request_one(),
            Err(error) => match self.strategy.clone() {
                ErrorStrategy::Stop => self.fail(error),
                ErrorStrategy::Continue(handler) => {
                    match handler(&error, &value as &dyn Any) {
                        Ok(()) => {
                            tracing::debug!(error = %error, "item dropped, continuing");
                            self.request_one();
                        }
                        Err(raised) => self.fail(raised),
                    }
                }
            },
        }
    }
}

struct TakeSubscription {
    upstream: SubscriptionRef,
    allowance: AtomicU64,
}

impl Subscription for TakeSubscription {
    fn request(&self, n: u64) {
        let mut current = self.allowance.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return;
            }
            let grant = n.min(current);
            match self.allowance.compare_exchange_weak(
                current,
                current - grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.upstream.request(grant);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

struct TakeSubscriber<T> {
    actual: BoxSubscriber<T>,
    limit: u64,
    remaining: u64,
    upstream: Option<SubscriptionRef>,
    done: bool,
}

impl<T: Item> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.remaining == 0 {
            subscription.cancel();
            self.done = true;
            self.actual.on_subscribe(EmptySubscription::shared());
            self.actual.on_signal(Signal::Complete);
            return;
        }
        self.upstream = Some(Arc::clone(&subscription));
        self.actual.on_subscribe(Arc::new(TakeSubscription {
            upstream: subscription,
            allowance: AtomicU64::new(self.limit),
        }));
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        if self.done {
            return;
        }
        match signal {
            Signal::Next(v) => {
                self.remaining -= 1;
                self.actual.on_signal(Signal::Next(v));
                if self.remaining == 0 {
                    self.done = true;
                    if let Some(up) = &self.upstream {
                        up.cancel();
                    }
                    self.actual.on_signal(Signal::Complete);
                }
            }
            terminal => {
                self.done = true;
                self.actual.on_signal(terminal);
            }
        }
    }
}

struct SkipSubscriber<T> {
    actual: BoxSubscriber<T>,
    remaining: u64,
    upstream: Option<SubscriptionRef>,
}

impl<T: Item> Subscriber<T> for SkipSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(Arc::clone(&subscription));
        self.actual.on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(_) if self.remaining > 0 => {
                self.remaining -= 1;
                if let Some(up) = &self.upstream {
                    up.request(1);
                }
            }
            other => self.actual.on_signal(other),
        }
    }
}

struct TakeWhileSubscriber<T, P> {
    actual: BoxSubscriber<T>,
    predicate: Arc<P>,
    upstream: Option<SubscriptionRef>,
    done: bool,
}

impl<T, P> Subscriber<T> for TakeWhileSubscriber<T, P>
where
    T: Item,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(Arc::clone(&subscription));
        self.actual.on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        if self.done {
            return;
        }
        match signal {
            Signal::Next(v) if !(self.predicate)(&v) => {
                self.done = true;
                if let Some(up) = self.upstream.take() {
                    up.cancel();
                }
                self.actual.on_signal(Signal::Complete);
            }
            Signal::Next(v) => self.actual.on_signal(Signal::Next(v)),
            terminal => {
                self.done = true;
                self.actual.on_signal(terminal);
            }
        }
    }
}

struct SkipWhileSubscriber<T, P> {
    actual: BoxSubscriber<T>,
    predicate: Arc<P>,
    upstream: Option<SubscriptionRef>,
    skipping: bool,
}

impl<T, P> Subscriber<T> for SkipWhileSubscriber<T, P>
where
    T: Item,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(Arc::clone(&subscription));
        self.actual.on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(v) if self.skipping && (self.predicate)(&v) => {
                if let Some(up) = &self.upstream {
                    up.request(1);
                }
            }
            Signal::Next(v) => {
                self.skipping = false;
                self.actual.on_signal(Signal::Next(v));
            }
            terminal => self.actual.on_signal(terminal),
        }
    }
}

struct ScanSubscriber<A, F> {
    actual: BoxSubscriber<A>,
    acc: Option<A>,
    f: Arc<F>,
}

impl<T, A, F> Subscriber<T> for ScanSubscriber<A, F>
where
    T: Item,
    A: Item + Clone,
    F: Fn(Option<A>, T) -> A + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.actual.on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(v) => {
                let next = (self.f)(self.acc.take(), v);
                self.acc = Some(next.clone());
                self.actual.on_signal(Signal::Next(next));
            }
            Signal::Error(e) => self.actual.on_signal(Signal::Error(e)),
            Signal::Complete => self.actual.on_signal(Signal::Complete),
        }
    }
}

struct SwitchIfEmptySubscriber<T> {
    actual: Option<BoxSubscriber<T>>,
    arbiter: Arc<SubscriptionArbiter>,
    alternative: Flux<T>,
    has_value: bool,
    cx: Context,
}

impl<T: Item> Subscriber<T> for SwitchIfEmptySubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.arbiter.set(subscription);
        if let Some(actual) = self.actual.as_mut() {
            actual.on_subscribe(self.arbiter.clone());
        }
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let Some(actual) = self.actual.as_mut() else {
            return;
        };
        match signal {
            Signal::Next(v) => {
                self.has_value = true;
                self.arbiter.produced(1);
                actual.on_signal(Signal::Next(v));
            }
            Signal::Complete if !self.has_value => {
                if let Some(actual) = self.actual.take() {
                    let forward = Forward::new(actual, Arc::clone(&self.arbiter));
                    self.alternative
                        .subscribe_inner(Box::new(forward), self.cx.clone());
                }
            }
            terminal => actual.on_signal(terminal),
        }
    }
}

impl<T: Item> Flux<T> {
    /// Transforms each item.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let doubled = Flux::range(1, 3).map(|v| v * 2);
    /// assert_eq!(doubled.collect_blocking(None).unwrap(), vec![2, 4, 6]);
    /// ```
    pub fn map<U, F>(self, f: F) -> Flux<U>
    where
        U: Item,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Flux::from_fn(move |sub, cx| {
            let map = MapSubscriber {
                actual: sub,
                f: Arc::clone(&f),
            };
            self.subscribe_inner(Box::new(map), cx);
        })
    }

    /// Keeps items matching `predicate`; dropped items are replaced by a
    /// `request(1)` upstream so demand never stalls.
    pub fn filter<P>(self, predicate: P) -> Flux<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Flux::from_fn(move |sub, cx| {
            let filter = FilterSubscriber {
                actual: sub,
                predicate: Arc::clone(&predicate),
                upstream: None,
            };
            self.subscribe_inner(Box::new(filter), cx);
        })
    }

    /// Fallible transform. An error terminates the sequence, unless an
    /// [`on_error_continue`](Flux::on_error_continue) placed downstream
    /// drops the item instead.
    pub fn try_map<U, E, F>(self, f: F) -> Flux<U>
    where
        U: Item,
        E: Into<BoxError>,
        F: Fn(&T) -> Result<U, E> + Send + Sync + 'static,
    {
        let step: Arc<TryStep<T, U>> =
            Arc::new(move |v: &T| f(v).map(Some).map_err(|e| FluxError::from_boxed(e.into())));
        self.try_step(step)
    }

    /// Fallible filter, with the same error rules as [`try_map`](Flux::try_map).
    pub fn try_filter<E, P>(self, predicate: P) -> Flux<T>
    where
        T: Clone,
        E: Into<BoxError>,
        P: Fn(&T) -> Result<bool, E> + Send + Sync + 'static,
    {
        let step: Arc<TryStep<T, T>> = Arc::new(move |v: &T| match predicate(v) {
            Ok(true) => Ok(Some(v.clone())),
            Ok(false) => Ok(None),
            Err(e) => Err(FluxError::from_boxed(e.into())),
        });
        self.try_step(step)
    }

    fn try_step<U: Item>(self, step: Arc<TryStep<T, U>>) -> Flux<U> {
        Flux::from_fn(move |sub, cx| {
            let subscriber = TrySubscriber {
                actual: sub,
                step: Arc::clone(&step),
                strategy: ErrorStrategy::from_context(&cx),
                upstream: None,
                done: false,
                cx: cx.clone(),
            };
            self.subscribe_inner(Box::new(subscriber), cx);
        })
    }

    /// Emits at most `n` items, then cancels upstream and completes.
    /// Upstream never sees more than `n` items requested in total.
    pub fn take(self, n: u64) -> Flux<T> {
        Flux::from_fn(move |sub, cx| {
            let take = TakeSubscriber {
                actual: sub,
                limit: n,
                remaining: n,
                upstream: None,
                done: false,
            };
            self.subscribe_inner(Box::new(take), cx);
        })
    }

    /// Drops the first `n` items.
    pub fn skip(self, n: u64) -> Flux<T> {
        Flux::from_fn(move |sub, cx| {
            let skip = SkipSubscriber {
                actual: sub,
                remaining: n,
                upstream: None,
            };
            self.subscribe_inner(Box::new(skip), cx);
        })
    }

    /// Relays items while `predicate` holds; the first item failing it is
    /// dropped, upstream is cancelled and the sequence completes.
    pub fn take_while<P>(self, predicate: P) -> Flux<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Flux::from_fn(move |sub, cx| {
            let take = TakeWhileSubscriber {
                actual: sub,
                predicate: Arc::clone(&predicate),
                upstream: None,
                done: false,
            };
            self.subscribe_inner(Box::new(take), cx);
        })
    }

    /// Drops items while `predicate` holds, then relays everything,
    /// including later items that would match again.
    pub fn skip_while<P>(self, predicate: P) -> Flux<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Flux::from_fn(move |sub, cx| {
            let skip = SkipWhileSubscriber {
                actual: sub,
                predicate: Arc::clone(&predicate),
                upstream: None,
                skipping: true,
            };
            self.subscribe_inner(Box::new(skip), cx);
        })
    }

    /// Running fold; the first item is emitted as is.
    pub fn scan<F>(self, f: F) -> Flux<T>
    where
        T: Clone,
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        let step = Arc::new(move |acc: Option<T>, v: T| match acc {
            Some(acc) => f(acc, v),
            None => v,
        });
        self.scan_inner(|| None, step)
    }

    /// Running fold from `seed`; emits the accumulator after each item.
    /// The seed itself is not emitted.
    pub fn scan_with_seed<A, F>(self, seed: A, f: F) -> Flux<A>
    where
        A: Item + Clone + Sync,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        let initial = seed.clone();
        let step = Arc::new(move |acc: Option<A>, v: T| f(acc.unwrap_or_else(|| initial.clone()), v));
        self.scan_inner(move || Some(seed.clone()), step)
    }

    fn scan_inner<A, S, F>(self, seed: S, step: Arc<F>) -> Flux<A>
    where
        A: Item + Clone,
        S: Fn() -> Option<A> + Send + Sync + 'static,
        F: Fn(Option<A>, T) -> A + Send + Sync + 'static,
    {
        Flux::from_fn(move |sub, cx| {
            let scan = ScanSubscriber {
                actual: sub,
                acc: seed(),
                f: Arc::clone(&step),
            };
            self.subscribe_inner(Box::new(scan), cx);
        })
    }

    /// Switches to `alternative` if this flux completes without items.
    pub fn switch_if_empty(self, alternative: Flux<T>) -> Flux<T> {
        Flux::from_fn(move |sub, cx| {
            let switch = SwitchIfEmptySubscriber {
                actual: Some(sub),
                arbiter: Arc::new(SubscriptionArbiter::new()),
                alternative: alternative.clone(),
                has_value: false,
                cx: cx.clone(),
            };
            self.subscribe_inner(Box::new(switch), cx);
        })
    }

    /// Emits `value` if this flux completes without items.
    pub fn default_if_empty(self, value: T) -> Flux<T>
    where
        T: Clone,
    {
        self.switch_if_empty(Flux::just(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StepVerifier;

    #[test]
    fn test_map_and_filter() {
        let flux = Flux::range(1, 10).map(|v| v * 3).filter(|v| v % 2 == 0);
        StepVerifier::create(flux)
            .expect_next_sequence([6, 12, 18, 24, 30])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_filter_rerequests_dropped_items() {
        let flux = Flux::range(1, 100).filter(|v| v % 10 == 0);
        StepVerifier::create_with_demand(flux, 2)
            .expect_next_sequence([10, 20])
            .then_request(1)
            .expect_next(30)
            .then_cancel()
            .verify()
            .unwrap();
    }

    #[test]
    fn test_try_map_stops_on_error() {
        let flux = Flux::range(1, 5).try_map(|v| {
            if *v == 3 {
                Err(FluxError::msg("three"))
            } else {
                Ok(v * 10)
            }
        });
        StepVerifier::create(flux)
            .expect_next_sequence([10, 20])
            .expect_error_message("three")
            .verify()
            .unwrap();
    }

    #[test]
    fn test_try_filter_continue() {
        let flux = Flux::range(1, 6)
            .try_filter(|v| {
                if *v == 4 {
                    Err(FluxError::msg("four"))
                } else {
                    Ok(v % 2 == 0)
                }
            })
            .on_error_continue(|_, _| Ok(()));
        StepVerifier::create(flux)
            .expect_next_sequence([2, 6])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_take_caps_upstream_demand() {
        let probe = crate::testing::PublisherProbe::of(Flux::range(1, 100));
        StepVerifier::create(probe.flux().take(3))
            .expect_next_sequence([1, 2, 3])
            .verify_complete()
            .unwrap();
        assert_eq!(probe.total_requested(), 3);
        probe.assert_was_cancelled();
    }

    #[test]
    fn test_take_zero_completes() {
        StepVerifier::create(Flux::range(1, 3).take(0))
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_skip_and_scan() {
        StepVerifier::create(Flux::range(1, 5).skip(2).scan(|a, b| a + b))
            .expect_next_sequence([3, 7, 12])
            .verify_complete()
            .unwrap();

        StepVerifier::create(Flux::range(1, 3).scan_with_seed(String::new(), |acc, v| format!("{acc}{v}")))
            .expect_next_sequence(["1".to_string(), "12".to_string(), "123".to_string()])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_switch_if_empty_and_default() {
        StepVerifier::create(Flux::<i64>::empty().switch_if_empty(Flux::range(7, 2)))
            .expect_next_sequence([7, 8])
            .verify_complete()
            .unwrap();
        StepVerifier::create(Flux::range(1, 1).default_if_empty(42))
            .expect_next(1)
            .verify_complete()
            .unwrap();
        StepVerifier::create_with_demand(Flux::<i64>::empty().default_if_empty(42), 0)
            .expect_no_event(std::time::Duration::from_millis(10))
            .then_request(1)
            .expect_next(42)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_take_while_cancels_at_first_rejection() {
        let source = crate::testing::PublisherProbe::of(Flux::range(1, 100));
        StepVerifier::create(source.flux().take_while(|v| *v < 4))
            .expect_next_sequence([1, 2, 3])
            .verify_complete()
            .unwrap();
        source.assert_was_cancelled();

        StepVerifier::create(Flux::range(1, 3).take_while(|_| true))
            .expect_next_sequence([1, 2, 3])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_skip_while_relays_once_predicate_fails() {
        let flux = Flux::from_iter(vec![1, 2, 5, 1, 6]).skip_while(|v| *v < 3);
        StepVerifier::create_with_demand(flux, 1)
            .expect_next(5)
            .then_request(2)
            .expect_next_sequence([1, 6])
            .verify_complete()
            .unwrap();
    }
}
