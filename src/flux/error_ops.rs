//! # Error-handling pipeline.
//!
//! | policy | operator | terminates? |
//! |---|---|---|
//! | stop (default) | none, or [`Flux::on_error_stop`] | yes |
//! | resume with fallback | [`Flux::on_error_resume`], [`Flux::on_error_return`], [`Flux::on_error_return_if`] | fallback decides |
//! | map error | [`Flux::on_error_map`] | yes |
//! | continue and drop | [`Flux::on_error_continue`] | no |
//! | resubscribe | [`Flux::retry`], [`Flux::retry_with`] | after exhaustion |
//!
//! ## Continue vs. resume
//! `on_error_continue` is a context write: it changes how `try_map` /
//! `try_filter` placed *upstream* of it react to a failing item. It does not
//! intercept terminal errors of arbitrary sources, and an `on_error_stop`
//! placed between restores the default for everything upstream of the stop.
//! `on_error_resume` intercepts the terminal error signal itself. When both
//! are present the outcome follows placement:
//!
//! ```text
//! try_map ─► on_error_continue ─► on_error_resume   item errors are dropped; resume never fires for them
//! try_map ─► on_error_resume ─► on_error_continue   continue still reaches try_map (context flows upstream)
//! try_map ─► on_error_stop ─► on_error_continue     stop shadows continue; first item error terminates
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Flux, Item};
use crate::context::{keys, Context};
use crate::error::FluxError;
use crate::policies::{RetryDecision, RetryPolicy};
use crate::protocol::{
    BoxSubscriber, Signal, Subscriber, SubscriptionArbiter, SubscriptionRef, WorkInProgress,
};
use crate::scheduler::timer_for;

/// Handler deciding whether a failing item is dropped (`Ok`) or the error
/// propagates (`Err`).
pub(crate) type ContinueHandler = Arc<dyn Fn(&FluxError, &dyn Any) -> Result<(), FluxError> + Send + Sync>;

/// How item-processing operators react to a failing item.
#[derive(Clone)]
pub(crate) enum ErrorStrategy {
    Stop,
    Continue(ContinueHandler),
}

impl ErrorStrategy {
    pub(crate) fn from_context(cx: &Context) -> Self {
        cx.get_reserved::<ErrorStrategy>(keys::ERROR_STRATEGY)
            .cloned()
            .unwrap_or(ErrorStrategy::Stop)
    }
}

/// Forwards signals to `actual`, reporting each item and each new upstream
/// to a shared arbiter.
pub(crate) struct Forward<T> {
    actual: BoxSubscriber<T>,
    arbiter: Arc<SubscriptionArbiter>,
}

impl<T> Forward<T> {
    pub(crate) fn new(actual: BoxSubscriber<T>, arbiter: Arc<SubscriptionArbiter>) -> Self {
        Self { actual, arbiter }
    }
}

impl<T: Item> Subscriber<T> for Forward<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.arbiter.set(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        if let Signal::Next(_) = &signal {
            self.arbiter.produced(1);
        }
        self.actual.on_signal(signal);
    }
}

type Fallback<T> = dyn Fn(FluxError) -> Flux<T> + Send + Sync;

struct ResumeSubscriber<T> {
    actual: Option<BoxSubscriber<T>>,
    arbiter: Arc<SubscriptionArbiter>,
    fallback: Arc<Fallback<T>>,
    cx: Context,
}

impl<T: Item> Subscriber<T> for ResumeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.arbiter.set(subscription);
        if let Some(actual) = self.actual.as_mut() {
            actual.on_subscribe(self.arbiter.clone());
        }
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Error(error) if !error.is_fatal() => {
                let Some(actual) = self.actual.take() else {
                    return;
                };
                tracing::debug!(error = %error, "resuming with fallback");
                let fallback = (self.fallback)(error);
                fallback.subscribe_inner(
                    Box::new(Forward::new(actual, Arc::clone(&self.arbiter))),
                    self.cx.clone(),
                );
            }
            other => {
                if let Some(actual) = self.actual.as_mut() {
                    if let Signal::Next(_) = &other {
                        self.arbiter.produced(1);
                    }
                    actual.on_signal(other);
                }
            }
        }
    }
}

struct MapErrorSubscriber<T, F> {
    actual: BoxSubscriber<T>,
    f: Arc<F>,
}

impl<T, F> Subscriber<T> for MapErrorSubscriber<T, F>
where
    T: Item,
    F: Fn(FluxError) -> FluxError + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.actual.on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Error(e) => self.actual.on_signal(Signal::Error((self.f)(e))),
            other => self.actual.on_signal(other),
        }
    }
}

/// Per-subscription retry state shared by successive attempts.
struct RetryState<T> {
    source: Flux<T>,
    policy: RetryPolicy,
    arbiter: Arc<SubscriptionArbiter>,
    pending: Mutex<Option<BoxSubscriber<T>>>,
    attempts: AtomicU32,
    wip: WorkInProgress,
    cx: Context,
}

impl<T: Item> RetryState<T> {
    /// Subscribes the parked subscriber again; nested resubscriptions loop here
    /// instead of recursing.
    fn resubscribe(self: &Arc<Self>) {
        self.wip.drain(|| {
            let Some(actual) = self.pending.lock().take() else {
                return;
            };
            if self.arbiter.is_cancelled() {
                return;
            }
            let attempt = RetrySubscriber {
                actual: Some(actual),
                state: Arc::clone(self),
                first: false,
            };
            self.source.subscribe_inner(Box::new(attempt), self.cx.clone());
        });
    }
}

struct RetrySubscriber<T> {
    actual: Option<BoxSubscriber<T>>,
    state: Arc<RetryState<T>>,
    first: bool,
}

impl<T: Item> Subscriber<T> for RetrySubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.state.arbiter.set(subscription);
        if self.first {
            if let Some(actual) = self.actual.as_mut() {
                actual.on_subscribe(self.state.arbiter.clone());
            }
        }
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let Some(actual) = self.actual.as_mut() else {
            return;
        };
        let error = match signal {
            Signal::Error(e) => e,
            other => {
                if let Signal::Next(_) = &other {
                    self.state.arbiter.produced(1);
                }
                actual.on_signal(other);
                return;
            }
        };
        let attempt = self.state.attempts.load(Ordering::Acquire);
        match self.state.policy.decide(&error, attempt) {
            RetryDecision::GiveUp => {
                let error = self.state.policy.exhausted(error, attempt);
                actual.on_signal(Signal::Error(error));
            }
            decision => {
                self.state.attempts.fetch_add(1, Ordering::AcqRel);
                let Some(actual) = self.actual.take() else {
                    return;
                };
                *self.state.pending.lock() = Some(actual);
                match decision {
                    RetryDecision::After(delay) => {
                        tracing::debug!(attempt = attempt + 1, ?delay, error = %error, "retry scheduled");
                        let state = Arc::clone(&self.state);
                        let scheduled = timer_for(&self.state.cx)
                            .schedule_after(delay, Box::new(move || state.resubscribe()));
                        if let Err(rejected) = scheduled {
                            if let Some(mut actual) = self.state.pending.lock().take() {
                                actual.on_signal(Signal::Error(rejected));
                            }
                        }
                    }
                    _ => {
                        tracing::debug!(attempt = attempt + 1, error = %error, "retrying");
                        self.state.resubscribe();
                    }
                }
            }
        }
    }
}

impl<T: Item> Flux<T> {
    /// Replaces a failed sequence with the flux returned by `fallback`.
    /// Items already emitted are kept. Protocol violations are never resumed.
    pub fn on_error_resume<F>(self, fallback: F) -> Flux<T>
    where
        F: Fn(FluxError) -> Flux<T> + Send + Sync + 'static,
    {
        let fallback: Arc<Fallback<T>> = Arc::new(fallback);
        Flux::from_fn(move |sub, cx| {
            let resume = ResumeSubscriber {
                actual: Some(sub),
                arbiter: Arc::new(SubscriptionArbiter::new()),
                fallback: Arc::clone(&fallback),
                cx: cx.clone(),
            };
            self.subscribe_inner(Box::new(resume), cx);
        })
    }

    /// Replaces an error with a single value, then completes.
    pub fn on_error_return(self, value: T) -> Flux<T>
    where
        T: Clone + Sync,
    {
        self.on_error_resume(move |_| Flux::just(value.clone()))
    }

    /// Replaces errors matching `predicate` with a single value; other
    /// errors propagate.
    pub fn on_error_return_if<P>(self, predicate: P, value: T) -> Flux<T>
    where
        T: Clone + Sync,
        P: Fn(&FluxError) -> bool + Send + Sync + 'static,
    {
        self.on_error_resume(move |e| {
            if predicate(&e) {
                Flux::just(value.clone())
            } else {
                Flux::error(e)
            }
        })
    }

    /// Transforms the error before it propagates.
    ///
    /// ```
    /// use rivulet::{Flux, FluxError};
    ///
    /// let flux = Flux::<i32>::error(FluxError::msg("io"))
    ///     .on_error_map(|e| e.wrap("loading failed"));
    /// let err = flux.block_last(None).unwrap_err();
    /// assert_eq!(err.to_string(), "loading failed");
    /// assert_eq!(err.root_cause().to_string(), "io");
    /// ```
    pub fn on_error_map<F>(self, f: F) -> Flux<T>
    where
        F: Fn(FluxError) -> FluxError + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Flux::from_fn(move |sub, cx| {
            let map = MapErrorSubscriber {
                actual: sub,
                f: Arc::clone(&f),
            };
            self.subscribe_inner(Box::new(map), cx);
        })
    }

    /// Lets `try_map` / `try_filter` upstream drop a failing item and keep
    /// going. `handler` receives the error and the item (as `&dyn Any`); it
    /// returns `Err` to terminate after all.
    pub fn on_error_continue<H>(self, handler: H) -> Flux<T>
    where
        H: Fn(&FluxError, &dyn Any) -> Result<(), FluxError> + Send + Sync + 'static,
    {
        let strategy = ErrorStrategy::Continue(Arc::new(handler));
        self.with_strategy(strategy)
    }

    /// Restores the default stop-on-error behaviour for operators upstream,
    /// shielding them from an `on_error_continue` further downstream.
    pub fn on_error_stop(self) -> Flux<T> {
        self.with_strategy(ErrorStrategy::Stop)
    }

    fn with_strategy(self, strategy: ErrorStrategy) -> Flux<T> {
        Flux::from_fn(move |sub, cx: Context| {
            let cx = cx.put_reserved(keys::ERROR_STRATEGY, strategy.clone());
            self.subscribe_inner(sub, cx);
        })
    }

    /// Resubscribes immediately on error, at most `max_retries` times.
    pub fn retry(self, max_retries: u32) -> Flux<T> {
        self.retry_with(RetryPolicy::immediate(max_retries))
    }

    /// Resubscribes on retryable errors according to `policy`.
    ///
    /// Delays run on the subscription's timer scheduler, so they follow
    /// virtual time under the test harness.
    pub fn retry_with(self, policy: RetryPolicy) -> Flux<T> {
        Flux::from_fn(move |sub, cx| {
            let state = Arc::new(RetryState {
                source: self.clone(),
                policy,
                arbiter: Arc::new(SubscriptionArbiter::new()),
                pending: Mutex::new(None),
                attempts: AtomicU32::new(0),
                wip: WorkInProgress::new(),
                cx: cx.clone(),
            });
            let first = RetrySubscriber {
                actual: Some(sub),
                state,
                first: true,
            };
            self.subscribe_inner(Box::new(first), cx);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::BackoffPolicy;
    use crate::testing::StepVerifier;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn failing_after(n: i64) -> Flux<i64> {
        Flux::range(1, n as usize).concat_with(Flux::error(FluxError::msg("boom")))
    }

    #[test]
    fn test_resume_keeps_emitted_items() {
        let flux = failing_after(2).on_error_resume(|_| Flux::range(10, 2));
        StepVerifier::create(flux)
            .expect_next_sequence([1, 2, 10, 11])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_resume_carries_demand() {
        let flux = failing_after(1).on_error_resume(|_| Flux::range(10, 5));
        StepVerifier::create_with_demand(flux, 3)
            .expect_next_sequence([1, 10, 11])
            .expect_no_event(Duration::from_millis(10))
            .then_cancel()
            .verify()
            .unwrap();
    }

    #[test]
    fn test_return_if_only_matching() {
        let flux = Flux::<i64>::error(FluxError::Canceled).on_error_return_if(|e| e.is_cancellation(), -1);
        StepVerifier::create(flux).expect_next(-1).verify_complete().unwrap();

        let flux = failing_after(0).on_error_return_if(|e| e.is_timeout(), -1);
        StepVerifier::create(flux).expect_error_message("boom").verify().unwrap();
    }

    #[test]
    fn test_continue_then_stop_placement() {
        let step = |v: &i64| {
            if *v % 2 == 0 {
                Err(FluxError::msg(format!("even {v}")))
            } else {
                Ok(*v)
            }
        };
        let dropped = Arc::new(AtomicUsize::new(0));
        let d = dropped.clone();
        let continued = Flux::range(1, 5).try_map(step).on_error_continue(move |_, item| {
            assert!(item.downcast_ref::<i64>().is_some());
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        StepVerifier::create(continued)
            .expect_next_sequence([1, 3, 5])
            .verify_complete()
            .unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 2);

        let stopped = Flux::range(1, 5)
            .try_map(step)
            .on_error_stop()
            .on_error_continue(|_, _| Ok(()));
        StepVerifier::create(stopped)
            .expect_next(1)
            .expect_error_message("even 2")
            .verify()
            .unwrap();
    }

    #[test]
    fn test_continue_handler_can_escalate() {
        let flux = Flux::range(1, 5)
            .try_map(|v| if *v == 2 { Err(FluxError::msg("two")) } else { Ok(*v) })
            .on_error_continue(|e, _| Err(e.clone().wrap("escalated")));
        StepVerifier::create(flux)
            .expect_next(1)
            .expect_error_message("escalated")
            .verify()
            .unwrap();
    }

    #[test]
    fn test_retry_immediate_resubscribes() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let s = subscriptions.clone();
        let flux = Flux::defer(move || {
            s.fetch_add(1, Ordering::SeqCst);
            failing_after(1)
        })
        .retry(2);
        StepVerifier::create(flux)
            .expect_next_sequence([1, 1, 1])
            .expect_error_message("boom")
            .verify()
            .unwrap();
        assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_deep_does_not_overflow_stack() {
        let flux = Flux::<i32>::error(FluxError::msg("always")).retry(100_000);
        StepVerifier::create(flux)
            .expect_error_message("always")
            .verify()
            .unwrap();
    }

    #[test]
    fn test_retry_backoff_under_virtual_time() {
        let policy = RetryPolicy::with_backoff(2, BackoffPolicy::exponential(Duration::from_secs(1)));
        StepVerifier::with_virtual_time(move || failing_after(1).retry_with(policy))
            .expect_next(1)
            .expect_no_event(Duration::from_secs(1))
            .expect_next(1)
            .then_await(Duration::from_secs(2))
            .expect_next(1)
            .expect_error_matches(|e| {
                e.as_label() == "flux_retry_exhausted" && e.root_cause().to_string() == "boom"
            })
            .verify()
            .unwrap();
    }

    #[test]
    fn test_protocol_errors_are_not_retried_or_resumed() {
        let fatal = FluxError::protocol("backpressure", "test");
        StepVerifier::create(Flux::<i32>::error(fatal.clone()).retry(3))
            .expect_error_matches(|e| e.is_fatal())
            .verify()
            .unwrap();
        StepVerifier::create(Flux::<i32>::error(fatal).on_error_resume(|_| Flux::just(1)))
            .expect_error_matches(|e| e.is_fatal())
            .verify()
            .unwrap();
    }
}
