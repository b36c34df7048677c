//! # Pairwise combination.
//!
//! `zip` subscribes to every source at once, buffers their items per source
//! and emits one combined row whenever every buffer has an item.
//!
//! ```text
//! a: a1 a2 a3 |
//! b: b1    b2 |
//!    ▼     ▼
//!   (a1,b1)(a2,b2) |      a3 is never emitted
//! ```
//!
//! ## Rules
//! - Completes as soon as a source is exhausted (completed with an empty
//!   buffer); the other sources are cancelled and their buffers discarded.
//! - The first error cancels every source.
//! - Each source is requested `prefetch` items and replenished as rows are
//!   consumed.

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
    add_demand, produced, BoxSubscriber, EmptySubscription, Signal, Subscriber, Subscription,
    SubscriptionRef, WorkInProgress,
};

type Combiner<T, R> = dyn Fn(Vec<T>) -> Result<R, FluxError> + Send + Sync;

struct Lane<T> {
    buffer: VecDeque<T>,
    subscription: Option<SubscriptionRef>,
    done: bool,
    consumed: u64,
}

struct ZipState<T, R> {
    downstream: Mutex<Option<BoxSubscriber<R>>>,
    lanes: Mutex<Vec<Lane<T>>>,
    error: Mutex<Option<FluxError>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    wip: WorkInProgress,
    combiner: Arc<Combiner<T, R>>,
    prefetch: u64,
    limit: u64,
    cx: Context,
}

enum Step<T> {
    Row(Vec<T>, Vec<(SubscriptionRef, u64)>),
    Exhausted,
    Wait,
}

impl<T: Item, R: Item> ZipState<T, R> {
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
        let subscriptions: Vec<SubscriptionRef> = self
            .lanes
            .lock()
            .iter_mut()
            .filter_map(|lane| {
                lane.buffer.clear();
                lane.subscription.take()
            })
            .collect();
        for s in subscriptions {
            s.cancel();
        }
    }

    fn next_step(&self) -> Step<T> {
        let mut lanes = self.lanes.lock();
        if lanes.iter().any(|l| l.done && l.buffer.is_empty()) {
            return Step::Exhausted;
        }
        if lanes.iter().any(|l| l.buffer.is_empty()) || self.requested.load(Ordering::Acquire) == 0 {
            return Step::Wait;
        }
        let mut row = Vec::with_capacity(lanes.len());
        let mut replenish = Vec::new();
        for lane in lanes.iter_mut() {
            if let Some(v) = lane.buffer.pop_front() {
                row.push(v);
            }
            lane.consumed += 1;
            if lane.consumed >= self.limit && !lane.done {
                if let Some(s) = &lane.subscription {
                    replenish.push((Arc::clone(s), lane.consumed));
                }
                lane.consumed = 0;
            }
        }
        Step::Row(row, replenish)
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
            let error = self.error.lock().take();
            if let Some(error) = error {
                self.terminated.store(true, Ordering::Release);
                let sub = guard.take();
                drop(guard);
                self.cancel_sources();
                if let Some(mut sub) = sub {
                    sub.on_signal(Signal::Error(error));
                }
                return;
            }
            match self.next_step() {
                Step::Row(row, replenish) => {
                    let combined = match (self.combiner)(row) {
                        Ok(combined) => combined,
                        Err(e) => {
                            *self.error.lock() = Some(e);
                            continue;
                        }
                    };
                    produced(&self.requested, 1);
                    if let Some(sub) = guard.as_mut() {
                        sub.on_signal(Signal::Next(combined));
                    }
                    for (s, n) in replenish {
                        s.request(n);
                    }
                }
                Step::Exhausted => {
                    self.terminated.store(true, Ordering::Release);
                    let sub = guard.take();
                    drop(guard);
                    self.cancel_sources();
                    if let Some(mut sub) = sub {
                        sub.on_signal(Signal::Complete);
                    }
                    return;
                }
                Step::Wait => return,
            }
        }
    }
}

impl<T: Item, R: Item> Subscription for ZipState<T, R> {
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

struct ZipSubscriber<T, R> {
    state: Arc<ZipState<T, R>>,
    index: usize,
}

impl<T: Item, R: Item> Subscriber<T> for ZipSubscriber<T, R> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let accepted = !self.state.terminated.load(Ordering::Acquire)
            && !self.state.cancelled.load(Ordering::Acquire);
        if accepted {
            if let Some(lane) = self.state.lanes.lock().get_mut(self.index) {
                lane.subscription = Some(Arc::clone(&subscription));
            }
            subscription.request(self.state.prefetch);
        } else {
            subscription.cancel();
        }
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let state = &self.state;
        if state.terminated.load(Ordering::Acquire) {
            return;
        }
        match signal {
            Signal::Next(v) => {
                if let Some(lane) = state.lanes.lock().get_mut(self.index) {
                    lane.buffer.push_back(v);
                }
            }
            Signal::Error(e) => return state.fail(e),
            Signal::Complete => {
                if let Some(lane) = state.lanes.lock().get_mut(self.index) {
                    lane.done = true;
                    lane.subscription = None;
                }
            }
        }
        state.wip.drain(|| state.drain_once());
    }
}

fn zip_engine<T: Item, R: Item>(sources: Vec<Flux<T>>, combiner: Arc<Combiner<T, R>>) -> Flux<R> {
    let prefetch = Config::default().prefetch_clamped() as u64;
    Flux::from_fn(move |mut sub, cx: Context| {
        if sources.is_empty() {
            sub.on_subscribe(EmptySubscription::shared());
            sub.on_signal(Signal::Complete);
            return;
        }
        let lanes = sources
            .iter()
            .map(|_| Lane {
                buffer: VecDeque::new(),
                subscription: None,
                done: false,
                consumed: 0,
            })
            .collect();
        let state = Arc::new(ZipState {
            downstream: Mutex::new(None),
            lanes: Mutex::new(lanes),
            error: Mutex::new(None),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            wip: WorkInProgress::new(),
            combiner: Arc::clone(&combiner),
            prefetch,
            limit: (prefetch - prefetch / 4).max(1),
            cx: cx.clone(),
        });
        state.wip.enter();
        sub.on_subscribe(state.clone());
        *state.downstream.lock() = Some(sub);
        state.wip.run(|| state.drain_once());
        for (index, source) in sources.iter().enumerate() {
            if state.cancelled.load(Ordering::Acquire) || state.terminated.load(Ordering::Acquire) {
                break;
            }
            let subscriber = ZipSubscriber {
                state: Arc::clone(&state),
                index,
            };
            source.subscribe_inner(Box::new(subscriber), cx.clone());
        }
    })
}

/// Tags items of two differently typed sources so they share one engine.
enum Either<A, B> {
    Left(A),
    Right(B),
}

fn pair<A, B>(row: Vec<Either<A, B>>) -> Result<(A, B), FluxError> {
    let mut it = row.into_iter();
    match (it.next(), it.next()) {
        (Some(Either::Left(a)), Some(Either::Right(b))) => Ok((a, b)),
        _ => Err(FluxError::protocol("zip_alignment", "row does not match its sources")),
    }
}

impl<T: Item> Flux<T> {
    /// Combines the n-th items of every source into one `Vec`.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let rows = Flux::zip(vec![Flux::range(0, 3), Flux::range(10, 2)]);
    /// assert_eq!(rows.collect_blocking(None).unwrap(), vec![vec![0, 10], vec![1, 11]]);
    /// ```
    pub fn zip(sources: Vec<Flux<T>>) -> Flux<Vec<T>> {
        let combiner: Arc<Combiner<T, Vec<T>>> = Arc::new(|row: Vec<T>| Ok(row));
        zip_engine(sources, combiner)
    }

    /// Pairs the items of this flux with those of `other`.
    pub fn zip_with<U: Item>(self, other: Flux<U>) -> Flux<(T, U)> {
        Flux::<(T, U)>::zip2(self, other)
    }
}

impl<A: Item, B: Item> Flux<(A, B)> {
    /// Pairs the n-th items of `a` and `b`.
    pub fn zip2(a: Flux<A>, b: Flux<B>) -> Flux<(A, B)> {
        let sources = vec![a.map(Either::Left), b.map(Either::Right)];
        let combiner: Arc<Combiner<Either<A, B>, (A, B)>> = Arc::new(pair::<A, B>);
        zip_engine(sources, combiner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UNBOUNDED;
    use crate::testing::{PublisherProbe, StepVerifier};

    #[test]
    fn test_truncates_to_shortest() {
        let flux = Flux::range(0, 3).zip_with(Flux::from_iter(vec!["a", "b"]));
        StepVerifier::create(flux)
            .expect_next((0, "a"))
            .expect_next((1, "b"))
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_exhausted_source_cancels_others() {
        let endless = PublisherProbe::of(Flux::<i64>::never());
        let flux = Flux::zip(vec![endless.flux(), Flux::empty()]);
        StepVerifier::create(flux).verify_complete().unwrap();
        endless.assert_was_cancelled();
    }

    #[test]
    fn test_rows_respect_demand() {
        let flux = Flux::zip(vec![Flux::range(0, 100), Flux::range(0, 100)]);
        StepVerifier::create_with_demand(flux, 2)
            .expect_next(vec![0, 0])
            .expect_next(vec![1, 1])
            .expect_no_event(std::time::Duration::from_millis(10))
            .then_request(UNBOUNDED)
            .expect_next_count(98)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_error_terminates_zip() {
        let flux = Flux::zip(vec![Flux::range(0, 5), Flux::error(FluxError::msg("zip"))]);
        StepVerifier::create(flux).expect_error_message("zip").verify().unwrap();
    }

    #[test]
    fn test_empty_source_list_completes() {
        StepVerifier::create(Flux::<i32>::zip(Vec::new())).verify_complete().unwrap();
    }
}
