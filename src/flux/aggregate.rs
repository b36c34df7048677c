//! # Folding operators.
//!
//! `reduce`, `count` and `collect_list` consume the whole upstream with
//! unbounded demand and emit one item on completion. Cancelling the result
//! cancels upstream.

use std::sync::Arc;

use super::scalar::{Outcome, ScalarEmitter};
use super::{Flux, Item};
use crate::protocol::{Signal, Subscriber, SubscriptionRef, UNBOUNDED};

struct FoldSubscriber<T, A, F> {
    emitter: Arc<ScalarEmitter<A>>,
    acc: Option<A>,
    f: Arc<F>,
    _item: std::marker::PhantomData<fn(T)>,
}

impl<T, A, F> Subscriber<T> for FoldSubscriber<T, A, F>
where
    T: Item,
    A: Item,
    F: Fn(Option<A>, T) -> A + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let upstream = Arc::clone(&subscription);
        self.emitter.set_on_cancel(move || upstream.cancel());
        subscription.request(UNBOUNDED);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(v) => {
                let acc = self.acc.take();
                self.acc = Some((self.f)(acc, v));
            }
            Signal::Error(e) => {
                self.acc = None;
                self.emitter.complete(Outcome::Error(e));
            }
            Signal::Complete => {
                let outcome = match self.acc.take() {
                    Some(acc) => Outcome::Value(acc),
                    None => Outcome::Empty,
                };
                self.emitter.complete(outcome);
            }
        }
    }
}

impl<T: Item> Flux<T> {
    fn fold<A, S, F>(self, seed: S, f: Arc<F>) -> Flux<A>
    where
        A: Item,
        S: Fn() -> Option<A> + Send + Sync + 'static,
        F: Fn(Option<A>, T) -> A + Send + Sync + 'static,
    {
        Flux::from_fn(move |sub, cx| {
            let emitter = ScalarEmitter::new();
            emitter.start(sub);
            if emitter.is_cancelled() {
                return;
            }
            let fold = FoldSubscriber {
                emitter,
                acc: seed(),
                f: Arc::clone(&f),
                _item: std::marker::PhantomData,
            };
            self.subscribe_inner(Box::new(fold), cx);
        })
    }

    /// Combines all items pairwise; an empty upstream completes empty.
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let sum = Flux::range(1, 4).reduce(|a, b| a + b);
    /// assert_eq!(sum.block_last(None).unwrap(), Some(10));
    /// ```
    pub fn reduce<F>(self, f: F) -> Flux<T>
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        let step = Arc::new(move |acc: Option<T>, v: T| match acc {
            Some(acc) => f(acc, v),
            None => v,
        });
        self.fold(|| None, step)
    }

    /// Folds all items into `seed`; an empty upstream emits the seed.
    pub fn reduce_with_seed<A, F>(self, seed: A, f: F) -> Flux<A>
    where
        A: Item + Clone + Sync,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        let initial = seed.clone();
        let step = Arc::new(move |acc: Option<A>, v: T| f(acc.unwrap_or_else(|| initial.clone()), v));
        self.fold(move || Some(seed.clone()), step)
    }

    /// Emits the number of items once upstream completes.
    pub fn count(self) -> Flux<u64> {
        let step = Arc::new(|acc: Option<u64>, _v: T| acc.unwrap_or(0) + 1);
        self.fold(|| Some(0), step)
    }

    /// Emits every item in one `Vec` once upstream completes.
    pub fn collect_list(self) -> Flux<Vec<T>> {
        let step = Arc::new(|acc: Option<Vec<T>>, v: T| {
            let mut list = acc.unwrap_or_default();
            list.push(v);
            list
        });
        self.fold(|| Some(Vec::new()), step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluxError;
    use crate::testing::{PublisherProbe, StepVerifier};

    #[test]
    fn test_reduce_sum_and_empty() {
        StepVerifier::create(Flux::range(1, 5).reduce(|a, b| a + b))
            .expect_next(15)
            .verify_complete()
            .unwrap();
        StepVerifier::create(Flux::<i64>::empty().reduce(|a, b| a + b))
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_reduce_with_seed_on_empty_emits_seed() {
        let flux = Flux::<i64>::empty().reduce_with_seed(String::from("seed"), |acc, v| acc + &v.to_string());
        StepVerifier::create(flux).expect_next("seed".to_string()).verify_complete().unwrap();
    }

    #[test]
    fn test_reduce_propagates_error_without_value() {
        let flux = Flux::range(1, 3)
            .concat_with(Flux::error(FluxError::msg("mid")))
            .reduce(|a, b| a + b);
        StepVerifier::create(flux).expect_error_message("mid").verify().unwrap();
    }

    #[test]
    fn test_count_and_collect_wait_for_demand() {
        StepVerifier::create_with_demand(Flux::range(0, 7).count(), 0)
            .expect_subscription()
            .expect_no_event(std::time::Duration::from_millis(10))
            .then_request(1)
            .expect_next(7)
            .verify_complete()
            .unwrap();
        StepVerifier::create(Flux::from_iter(vec!['a', 'b']).collect_list())
            .expect_next(vec!['a', 'b'])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_cancel_reaches_upstream() {
        let probe = PublisherProbe::of(Flux::<i32>::never());
        StepVerifier::create(probe.flux().collect_list())
            .expect_subscription()
            .then_cancel()
            .verify()
            .unwrap();
        probe.assert_was_requested();
        probe.assert_was_cancelled();
    }
}
