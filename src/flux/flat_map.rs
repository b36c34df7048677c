//! # Merging inner sequences.
//!
//! `flat_map` maps each outer item to an inner flux and merges the inners
//! into one output in arrival order. `flat_map_sequential`, `concat_map`,
//! `merge`, `concat` and `filter_when` are configurations of the same engine.
//!
//! ```text
//! outer ──item──► mapper ──► inner #k ──► [prefetch queue] ──┐
//!   ▲                                                        ├──► arrival-ordered queue ──drain──► downstream
//!   └── request(1) when an inner completes (bounded)         │
//!                     inner #k+1 ───────────────────────────┘
//! ```
//!
//! ## Rules
//! - At most `concurrency` inners are subscribed at once; the outer is
//!   requested `concurrency` items up front and one more per finished inner.
//! - Each inner is requested `prefetch` items and replenished after three
//!   quarters of them were delivered downstream.
//! - The first error from the outer or any inner cancels everything else and
//!   is delivered at once; queued items are discarded.
//! - Completion is delivered once the outer completed, every inner completed
//!   and the queue is empty.
//! - In sequential mode inners still run concurrently, but their items are
//!   buffered per inner and released in outer order: an inner's items go out
//!   only after every earlier inner completed and was drained.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Flux, Item};
use crate::config::Config;
use crate::context::Context;
use crate::error::{AssemblyError, FluxError};
use crate::hooks;
use crate::protocol::{
    add_demand, produced, BoxSubscriber, Signal, Subscriber, Subscription, SubscriptionRef,
    WorkInProgress, UNBOUNDED,
};

type Mapper<T, U> = dyn Fn(T) -> Flux<U> + Send + Sync;

#[derive(Default)]
struct InnerSlot {
    subscription: Option<SubscriptionRef>,
    consumed: u64,
}

/// Items waiting for downstream demand, tagged with the inner they came from.
enum Pending<U> {
    Arrival(VecDeque<(usize, U)>),
    Ordered(BTreeMap<usize, VecDeque<U>>),
}

impl<U> Pending<U> {
    fn new(ordered: bool) -> Self {
        if ordered {
            Pending::Ordered(BTreeMap::new())
        } else {
            Pending::Arrival(VecDeque::new())
        }
    }

    fn push(&mut self, id: usize, value: U) {
        match self {
            Pending::Arrival(queue) => queue.push_back((id, value)),
            Pending::Ordered(buffers) => buffers.entry(id).or_default().push_back(value),
        }
    }

    /// Next deliverable item. In ordered mode `head` is the oldest inner
    /// still running; nothing buffered behind it may overtake it.
    fn pop(&mut self, head: Option<usize>) -> Option<(usize, U)> {
        match self {
            Pending::Arrival(queue) => queue.pop_front(),
            Pending::Ordered(buffers) => {
                let mut entry = buffers.first_entry()?;
                let id = *entry.key();
                if head.is_some_and(|h| h < id) {
                    return None;
                }
                let value = entry.get_mut().pop_front();
                if entry.get().is_empty() {
                    entry.remove();
                }
                value.map(|v| (id, v))
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Pending::Arrival(queue) => queue.is_empty(),
            Pending::Ordered(buffers) => buffers.is_empty(),
        }
    }

    fn clear(&mut self) {
        match self {
            Pending::Arrival(queue) => queue.clear(),
            Pending::Ordered(buffers) => buffers.clear(),
        }
    }
}

struct MergeState<T, U> {
    downstream: Mutex<Option<BoxSubscriber<U>>>,
    upstream: Mutex<Option<SubscriptionRef>>,
    inners: Mutex<BTreeMap<usize, InnerSlot>>,
    queue: Mutex<Pending<U>>,
    error: Mutex<Option<FluxError>>,
    requested: AtomicU64,
    active: AtomicUsize,
    next_id: AtomicUsize,
    outer_done: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    wip: WorkInProgress,
    mapper: Arc<Mapper<T, U>>,
    concurrency: Option<usize>,
    ordered: bool,
    prefetch: u64,
    limit: u64,
    cx: Context,
}

impl<T: Item, U: Item> MergeState<T, U> {
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
        let inners: Vec<SubscriptionRef> = std::mem::take(&mut *self.inners.lock())
            .into_values()
            .filter_map(|slot| slot.subscription)
            .collect();
        if let Some(up) = upstream {
            up.cancel();
        }
        for inner in inners {
            inner.cancel();
        }
    }

    fn request_outer(&self, n: u64) {
        let upstream = self.upstream.lock().clone();
        if let Some(up) = upstream {
            up.request(n);
        }
    }

    /// Counts one delivered item of inner `id`; returns the inner to
    /// replenish and how much once the threshold is reached.
    fn consumed(&self, id: usize) -> Option<(SubscriptionRef, u64)> {
        let mut inners = self.inners.lock();
        let slot = inners.get_mut(&id)?;
        slot.consumed += 1;
        if slot.consumed < self.limit {
            return None;
        }
        let n = std::mem::take(&mut slot.consumed);
        slot.subscription.clone().map(|s| (s, n))
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
            let next = if self.requested.load(Ordering::Acquire) > 0 {
                let head = if self.ordered {
                    self.inners.lock().keys().next().copied()
                } else {
                    None
                };
                self.queue.lock().pop(head)
            } else {
                None
            };
            if let Some((id, value)) = next {
                produced(&self.requested, 1);
                if let Some(sub) = guard.as_mut() {
                    sub.on_signal(Signal::Next(value));
                }
                if let Some((inner, n)) = self.consumed(id) {
                    inner.request(n);
                }
                continue;
            }
            let finished = self.outer_done.load(Ordering::Acquire)
                && self.active.load(Ordering::Acquire) == 0
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

impl<T: Item, U: Item> Subscription for MergeState<T, U> {
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
    state: Arc<MergeState<T, U>>,
}

impl<T: Item, U: Item> Subscriber<T> for OuterSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        *self.state.upstream.lock() = Some(Arc::clone(&subscription));
        if self.state.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        let initial = self.state.concurrency.map_or(UNBOUNDED, |c| c as u64);
        subscription.request(initial);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let state = &self.state;
        match signal {
            Signal::Next(value) => {
                if state.cancelled.load(Ordering::Acquire) || state.terminated.load(Ordering::Acquire) {
                    return;
                }
                let id = state.next_id.fetch_add(1, Ordering::Relaxed);
                state.active.fetch_add(1, Ordering::AcqRel);
                state.inners.lock().insert(id, InnerSlot::default());
                let inner = (state.mapper)(value);
                let subscriber = InnerSubscriber {
                    state: Arc::clone(state),
                    id,
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
    state: Arc<MergeState<T, U>>,
    id: usize,
}

impl<T: Item, U: Item> Subscriber<U> for InnerSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let registered = match self.state.inners.lock().get_mut(&self.id) {
            Some(slot) => {
                slot.subscription = Some(Arc::clone(&subscription));
                true
            }
            None => false,
        };
        if !registered || self.state.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        subscription.request(self.state.prefetch);
    }

    fn on_signal(&mut self, signal: Signal<U>) {
        let state = &self.state;
        match signal {
            Signal::Next(value) => {
                if state.terminated.load(Ordering::Acquire) {
                    return;
                }
                state.queue.lock().push(self.id, value);
                state.wip.drain(|| state.drain_once());
            }
            Signal::Error(e) => state.fail(e),
            Signal::Complete => {
                state.inners.lock().remove(&self.id);
                state.active.fetch_sub(1, Ordering::AcqRel);
                if state.concurrency.is_some() && !state.outer_done.load(Ordering::Acquire) {
                    state.request_outer(1);
                }
                state.wip.drain(|| state.drain_once());
            }
        }
    }
}

impl<T: Item> Flux<T> {
    fn merge_engine<U: Item>(
        self,
        mapper: Arc<Mapper<T, U>>,
        concurrency: Option<usize>,
        ordered: bool,
    ) -> Flux<U> {
        let prefetch = Config::default().prefetch_clamped() as u64;
        Flux::from_fn(move |mut sub, cx: Context| {
            let state = Arc::new(MergeState {
                downstream: Mutex::new(None),
                upstream: Mutex::new(None),
                inners: Mutex::new(BTreeMap::new()),
                queue: Mutex::new(Pending::new(ordered)),
                error: Mutex::new(None),
                requested: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                outer_done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                wip: WorkInProgress::new(),
                mapper: Arc::clone(&mapper),
                concurrency,
                ordered,
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

    /// Maps each item to an inner flux and merges all inners concurrently.
    /// Output follows arrival order, not input order.
    pub fn flat_map<U, F>(self, f: F) -> Flux<U>
    where
        U: Item,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        let concurrency = Config::default().concurrency_limit();
        self.merge_engine(Arc::new(f), concurrency, false)
    }

    /// Subscribes to inners as eagerly as [`flat_map`](Flux::flat_map) but
    /// emits their items in input order. Items of later inners are buffered,
    /// up to `prefetch` each, until the earlier ones finish.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let flux = Flux::range(1, 3).flat_map_sequential(|v| Flux::range(v * 10, 2));
    /// assert_eq!(flux.collect_blocking(None).unwrap(), vec![10, 11, 20, 21, 30, 31]);
    /// ```
    pub fn flat_map_sequential<U, F>(self, f: F) -> Flux<U>
    where
        U: Item,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        let concurrency = Config::default().concurrency_limit();
        self.merge_engine(Arc::new(f), concurrency, true)
    }

    /// Like [`flat_map`](Flux::flat_map) with at most `concurrency` inners
    /// subscribed at once.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// assert!(Flux::range(1, 3).flat_map_with(|v| Flux::just(v), 0).is_err());
    /// ```
    pub fn flat_map_with<U, F>(self, f: F, concurrency: usize) -> Result<Flux<U>, AssemblyError>
    where
        U: Item,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        let concurrency = AssemblyError::positive("concurrency", concurrency)?;
        Ok(self.merge_engine(Arc::new(f), Some(concurrency), false))
    }

    /// Maps each item to an inner flux and drains the inners one after
    /// another, preserving input order.
    pub fn concat_map<U, F>(self, f: F) -> Flux<U>
    where
        U: Item,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        self.merge_engine(Arc::new(f), Some(1), false)
    }

    /// Keeps an item when the first value of `predicate(&item)` is `true`.
    /// Predicates are evaluated one at a time, in input order; one that
    /// completes empty drops the item and one that fails fails the sequence.
    pub fn filter_when<P>(self, predicate: P) -> Flux<T>
    where
        T: Clone + Sync,
        P: Fn(&T) -> Flux<bool> + Send + Sync + 'static,
    {
        self.concat_map(move |v| {
            predicate(&v)
                .take(1)
                .filter(|keep| *keep)
                .map(move |_| v.clone())
        })
    }

    /// Subscribes to all sources at once and interleaves their items.
    pub fn merge(sources: Vec<Flux<T>>) -> Flux<T> {
        Flux::from_iter(sources).flat_map(|f| f)
    }

    /// Drains the sources one after another.
    pub fn concat(sources: Vec<Flux<T>>) -> Flux<T> {
        Flux::from_iter(sources).concat_map(|f| f)
    }

    /// Merges this flux with `other`.
    pub fn merge_with(self, other: Flux<T>) -> Flux<T> {
        Flux::merge(vec![self, other])
    }

    /// Continues with `other` once this flux completes.
    pub fn concat_with(self, other: Flux<T>) -> Flux<T> {
        Flux::concat(vec![self, other])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PublisherProbe, StepVerifier, TestPublisher};
    use std::time::Duration;

    fn delayed(v: i64) -> Flux<i64> {
        let delay = if v == 1 { Duration::from_secs(2) } else { Duration::from_secs(1) };
        Flux::just(v * 10).delay_elements(delay)
    }

    #[test]
    fn test_flat_map_arrival_order() {
        StepVerifier::with_virtual_time(|| Flux::from_iter(vec![1, 2]).flat_map(delayed))
            .then_await(Duration::from_secs(2))
            .expect_next_sequence([20, 10])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_concat_map_input_order() {
        StepVerifier::with_virtual_time(|| Flux::from_iter(vec![1, 2]).concat_map(delayed))
            .then_await(Duration::from_secs(3))
            .expect_next_sequence([10, 20])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_flat_map_respects_downstream_demand() {
        let flux = Flux::range(0, 3).flat_map(|v| Flux::range(v * 10, 3));
        StepVerifier::create_with_demand(flux, 4)
            .expect_next_count(4)
            .expect_no_event(Duration::from_millis(10))
            .then_request(UNBOUNDED)
            .expect_next_count(5)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_inner_error_cancels_siblings() {
        let sibling = PublisherProbe::of(Flux::<i64>::never());
        let s = sibling.clone();
        let flux = Flux::from_iter(vec![0, 1]).flat_map(move |v| {
            if v == 0 {
                s.flux()
            } else {
                Flux::error(FluxError::msg("inner"))
            }
        });
        StepVerifier::create(flux).expect_error_message("inner").verify().unwrap();
        sibling.assert_was_cancelled();
    }

    #[test]
    fn test_bounded_concurrency_requests_outer_lazily() {
        let outer = TestPublisher::<i64>::create();
        let flux = outer.flux().flat_map_with(|_| Flux::<i64>::never(), 2).unwrap();
        let driver = outer.clone();
        StepVerifier::create(flux)
            .then(move || {
                driver.assert_min_requested(2);
                driver.next(1).next(2);
            })
            .then_cancel()
            .verify()
            .unwrap();
        outer.assert_was_cancelled();
    }

    #[test]
    fn test_concat_stops_at_first_error() {
        let never_subscribed = PublisherProbe::of(Flux::just(9));
        let flux = Flux::concat(vec![
            Flux::just(1),
            Flux::error(FluxError::msg("stop")),
            never_subscribed.flux(),
        ]);
        StepVerifier::create(flux)
            .expect_next(1)
            .expect_error_message("stop")
            .verify()
            .unwrap();
        never_subscribed.assert_was_not_subscribed();
    }

    #[test]
    fn test_merge_completes_after_all_sources() {
        let flux = Flux::merge(vec![Flux::range(0, 2), Flux::empty(), Flux::range(5, 1)]);
        StepVerifier::create(flux)
            .expect_next_sequence([0, 1, 5])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_long_synchronous_concat_does_not_overflow() {
        let flux = Flux::range(0, 50_000).concat_map(Flux::just);
        StepVerifier::create(flux).expect_next_count(50_000).verify_complete().unwrap();
    }

    #[test]
    fn test_flat_map_sequential_keeps_input_order() {
        // Both inners run at once, so everything is out after 2s even
        // though the first inner is the slower one.
        StepVerifier::with_virtual_time(|| Flux::from_iter(vec![1, 2]).flat_map_sequential(delayed))
            .expect_subscription()
            .expect_no_event(Duration::from_secs(2))
            .expect_next_sequence([10, 20])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_flat_map_sequential_buffers_later_inners() {
        let first = TestPublisher::<i64>::create();
        let second = TestPublisher::<i64>::create();
        let (f, s) = (first.clone(), second.clone());
        let flux = Flux::from_iter(vec![0, 1])
            .flat_map_sequential(move |v| if v == 0 { f.flux() } else { s.flux() });
        let (d1, d2) = (first.clone(), second.clone());
        StepVerifier::create(flux)
            .then(move || {
                d2.next(20).next(21).complete();
                d1.next(10);
            })
            .expect_next(10)
            .expect_no_event(Duration::from_millis(20))
            .then(move || first.complete())
            .expect_next_sequence([20, 21])
            .verify_complete()
            .unwrap();
        second.assert_was_subscribed();
    }

    #[test]
    fn test_filter_when_uses_first_predicate_value() {
        let flux = Flux::range(1, 6).filter_when(|v| match v % 3 {
            0 => Flux::empty(),
            1 => Flux::from_iter(vec![true, false]),
            _ => Flux::just(false),
        });
        StepVerifier::create(flux)
            .expect_next_sequence([1, 4])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_filter_when_predicate_error_fails() {
        let flux = Flux::range(1, 3).filter_when(|v| {
            if *v == 2 {
                Flux::error(FluxError::msg("predicate"))
            } else {
                Flux::just(true)
            }
        });
        StepVerifier::create(flux)
            .expect_next(1)
            .expect_error_message("predicate")
            .verify()
            .unwrap();
    }
}
