//! # Constructors.
//!
//! Cold sources: each subscription replays the sequence from the start.

use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::scalar::{Outcome, ScalarEmitter};
use super::{Flux, Item, Publisher};
use crate::context::Context;
use crate::error::{BoxError, FluxError};
use crate::protocol::{
    add_demand, produced, BoxSubscriber, EmptySubscription, Signal, Subscription, WorkInProgress,
};

struct IterPublisher<I> {
    template: Mutex<I>,
}

impl<I> Publisher<I::Item> for IterPublisher<I>
where
    I: Iterator + Clone + Send + 'static,
    I::Item: Item,
{
    fn subscribe(&self, mut subscriber: BoxSubscriber<I::Item>, _cx: Context) {
        let iter = self.template.lock().clone();
        let sub = Arc::new(IterSubscription {
            downstream: Mutex::new(None),
            iter: Mutex::new(iter.peekable()),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            wip: WorkInProgress::new(),
        });
        sub.wip.enter();
        subscriber.on_subscribe(sub.clone());
        *sub.downstream.lock() = Some(subscriber);
        sub.wip.run(|| sub.drain_once());
    }
}

struct IterSubscription<I: Iterator> {
    downstream: Mutex<Option<BoxSubscriber<I::Item>>>,
    iter: Mutex<Peekable<I>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    wip: WorkInProgress,
}

impl<I> IterSubscription<I>
where
    I: Iterator + Send + 'static,
    I::Item: Item,
{
    fn drain_once(&self) {
        let mut guard = self.downstream.lock();
        if guard.is_none() {
            return;
        }
        let mut iter = self.iter.lock();
        let mut requested = self.requested.load(Ordering::Acquire);
        let mut emitted = 0_u64;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                guard.take();
                return;
            }
            if iter.peek().is_none() {
                if let Some(mut sub) = guard.take() {
                    drop(iter);
                    drop(guard);
                    sub.on_signal(Signal::Complete);
                }
                return;
            }
            if emitted == requested {
                requested = produced(&self.requested, emitted);
                emitted = 0;
                if requested == 0 {
                    return;
                }
                continue;
            }
            let Some(value) = iter.next() else { continue };
            if let Some(sub) = guard.as_mut() {
                sub.on_signal(Signal::Next(value));
            }
            emitted += 1;
        }
    }
}

impl<I> Subscription for IterSubscription<I>
where
    I: Iterator + Send + 'static,
    I::Item: Item,
{
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        add_demand(&self.requested, n);
        self.wip.drain(|| self.drain_once());
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.wip.drain(|| self.drain_once());
        }
    }
}

/// Keeps the subscriber of a silent source alive until cancelled.
struct NeverSubscription<T> {
    downstream: Mutex<Option<BoxSubscriber<T>>>,
}

impl<T: Item> Subscription for NeverSubscription<T> {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {
        self.downstream.lock().take();
    }
}

impl<T: Item> Flux<T> {
    /// Emits the items of `iter`, then completes.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let squares = Flux::from_iter((1..=3).map(|v| v * v));
    /// assert_eq!(squares.collect_blocking(None).unwrap(), vec![1, 4, 9]);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Clone + Send + 'static,
    {
        Self::from_publisher(IterPublisher {
            template: Mutex::new(iter.into_iter()),
        })
    }

    /// Emits `value`, then completes.
    pub fn just(value: T) -> Self
    where
        T: Clone,
    {
        Self::from_iter(std::iter::once(value))
    }

    /// Emits the value if present, then completes.
    pub fn just_or_empty(value: Option<T>) -> Self
    where
        T: Clone,
    {
        Self::from_iter(value)
    }

    /// Completes without emitting.
    pub fn empty() -> Self {
        Self::from_fn(|mut sub, _cx| {
            sub.on_subscribe(EmptySubscription::shared());
            sub.on_signal(Signal::Complete);
        })
    }

    /// Fails immediately with `error`.
    pub fn error(error: FluxError) -> Self {
        Self::from_fn(move |mut sub, _cx| {
            sub.on_subscribe(EmptySubscription::shared());
            sub.on_signal(Signal::Error(error.clone()));
        })
    }

    /// Never signals anything after `on_subscribe`.
    pub fn never() -> Self {
        Self::from_fn(|mut sub, _cx| {
            let holder = Arc::new(NeverSubscription {
                downstream: Mutex::new(None),
            });
            sub.on_subscribe(holder.clone());
            *holder.downstream.lock() = Some(sub);
        })
    }

    /// Builds a fresh flux for every subscription.
    pub fn defer<F>(supplier: F) -> Self
    where
        F: Fn() -> Flux<T> + Send + Sync + 'static,
    {
        Self::from_fn(move |sub, cx| supplier().subscribe_inner(sub, cx))
    }

    /// Calls `callable` once per subscription and emits its result.
    ///
    /// An error returned by the callable, boxed or not, is delivered with
    /// its identity intact.
    pub fn from_callable<F, E>(callable: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_fn(move |sub, _cx| {
            let emitter = ScalarEmitter::new();
            emitter.start(sub);
            if emitter.is_cancelled() {
                return;
            }
            let outcome = match callable() {
                Ok(v) => Outcome::Value(v),
                Err(e) => Outcome::Error(FluxError::from_boxed(e.into())),
            };
            emitter.complete(outcome);
        })
    }
}

impl Flux<i64> {
    /// Emits `count` consecutive integers starting at `start`.
    pub fn range(start: i64, count: usize) -> Self {
        Self::from_iter((0..count).map(move |i| start.saturating_add(i as i64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StepVerifier;

    #[test]
    fn test_from_iter_honours_demand() {
        StepVerifier::create_with_demand(Flux::range(1, 5), 2)
            .expect_next(1)
            .expect_next(2)
            .expect_no_event(std::time::Duration::from_millis(20))
            .then_request(10)
            .expect_next_sequence([3, 4, 5])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_empty_iterator_completes_without_demand() {
        StepVerifier::create_with_demand(Flux::from_iter(Vec::<i32>::new()), 0)
            .expect_subscription()
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_cold_replay_per_subscription() {
        let flux = Flux::from_iter(vec!["a", "b"]);
        for _ in 0..2 {
            StepVerifier::create(flux.clone())
                .expect_next_sequence(["a", "b"])
                .verify_complete()
                .unwrap();
        }
    }

    #[test]
    fn test_from_callable_preserves_error() {
        let flux = Flux::<i32>::from_callable(|| Err(std::io::Error::other("disk")));
        StepVerifier::create(flux)
            .expect_error_of::<std::io::Error>()
            .verify()
            .unwrap();

        let flux = Flux::from_callable(|| Ok::<_, FluxError>(5));
        StepVerifier::create(flux).expect_next(5).verify_complete().unwrap();
    }

    #[test]
    fn test_defer_builds_per_subscription() {
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        let flux = Flux::defer(move || {
            let n = c.fetch_add(1, Ordering::SeqCst) as i64;
            Flux::just(n)
        });
        StepVerifier::create(flux.clone()).expect_next(0).verify_complete().unwrap();
        StepVerifier::create(flux).expect_next(1).verify_complete().unwrap();
    }

    #[test]
    fn test_never_and_cancel() {
        StepVerifier::create(Flux::<i32>::never())
            .expect_subscription()
            .expect_no_event(std::time::Duration::from_millis(20))
            .then_cancel()
            .verify()
            .unwrap();
    }

    #[test]
    fn test_error_source() {
        StepVerifier::create(Flux::<i32>::error(FluxError::msg("nope")))
            .expect_error_message("nope")
            .verify()
            .unwrap();
    }
}
