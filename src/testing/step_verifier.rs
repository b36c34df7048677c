//! # Scripted verification.
//!
//! A [`StepVerifier`] is assembled from expectations, then replayed against
//! one subscription by [`Verification::verify`].
//!
//! ```text
//! assembling ──expect_*/then_*──► assembling
//!     │
//!     └─terminal (expect_complete | expect_error* | then_cancel)──► ready
//!                                                                     │
//!                                       verify() ──► verifying ──► completed | failed
//! ```
//!
//! ## Rules
//! - Signals are recorded in arrival order and matched strictly in order.
//! - Under virtual time the clock only moves on `then_await` and
//!   `expect_no_event`; waiting for a signal never advances it.
//! - `expect_no_event(d)` under virtual time covers `[now, now + d)`: a
//!   signal due exactly at `now + d` is left for the next step.
//! - After `expect_complete`/`expect_error*` no further signal may be queued.
//! - Every step waits at most `verify_timeout` of wall-clock time.

use std::any::Any;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config::Config;
use crate::context::{keys, Context};
use crate::error::FluxError;
use crate::flux::{Flux, Item};
use crate::hooks;
use crate::protocol::{Signal, Subscriber, SubscriptionRef, UNBOUNDED};
use crate::scheduler::{Scheduler, VirtualTimeScheduler};

/// Knobs of one verification run.
#[derive(Clone, Debug)]
pub struct StepVerifierOptions {
    /// Demand requested right after subscription (`0` = none).
    pub initial_request: u64,
    /// Context the verifier subscribes with.
    pub context: Context,
    /// Wall-clock bound per step (`None` = wait forever).
    pub verify_timeout: Option<Duration>,
    /// Installs a fresh [`VirtualTimeScheduler`] as the timer of the run.
    pub virtual_time: bool,
}

impl StepVerifierOptions {
    /// Options with the timeout taken from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_request: UNBOUNDED,
            context: Context::empty(),
            verify_timeout: config.verify_timeout_opt(),
            virtual_time: false,
        }
    }
}

impl Default for StepVerifierOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a verification failed.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// A signal of the wrong kind or value arrived.
    #[error("step {step}: expected {expected}, got {actual}")]
    Mismatch {
        /// 1-based step index.
        step: usize,
        /// What the step expected.
        expected: String,
        /// What arrived instead.
        actual: String,
    },

    /// Nothing arrived within the verify timeout.
    #[error("step {step}: expected {expected}, nothing arrived within {waited:?}")]
    Timeout {
        /// 1-based step index.
        step: usize,
        /// What the step expected.
        expected: String,
        /// How long the step waited.
        waited: Duration,
    },

    /// A predicate or context check rejected what arrived.
    #[error("step {step}: {expected} failed: {message}")]
    Assertion {
        /// 1-based step index.
        step: usize,
        /// What the step expected.
        expected: String,
        /// Details from the check.
        message: String,
    },
}

impl VerifyError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            VerifyError::Mismatch { .. } => "verify_mismatch",
            VerifyError::Timeout { .. } => "verify_timeout",
            VerifyError::Assertion { .. } => "verify_assertion",
        }
    }
}

enum Event<T> {
    Next(T),
    Error(FluxError),
    Complete,
}

fn describe<T: Debug>(event: &Event<T>) -> String {
    match event {
        Event::Next(v) => format!("on_next({v:?})"),
        Event::Error(e) => format!("on_error({e})"),
        Event::Complete => "on_complete".to_string(),
    }
}

struct Recorded<T> {
    subscribed: bool,
    subscription: Option<SubscriptionRef>,
    events: VecDeque<Event<T>>,
}

struct Recorder<T> {
    state: Mutex<Recorded<T>>,
    arrived: Condvar,
}

#[derive(Default)]
struct Dropped {
    items: Mutex<Vec<Box<dyn Any + Send>>>,
    errors: Mutex<Vec<FluxError>>,
}

struct RecordingSubscriber<T> {
    recorder: Arc<Recorder<T>>,
    initial_request: u64,
}

impl<T: Item> Subscriber<T> for RecordingSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        {
            let mut state = self.recorder.state.lock();
            state.subscribed = true;
            state.subscription = Some(Arc::clone(&subscription));
        }
        self.recorder.arrived.notify_all();
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let event = match signal {
            Signal::Next(v) => Event::Next(v),
            Signal::Error(e) => Event::Error(e),
            Signal::Complete => Event::Complete,
        };
        self.recorder.state.lock().events.push_back(event);
        self.recorder.arrived.notify_all();
    }
}

type Check<A> = Box<dyn FnOnce(A) -> Result<(), String> + Send>;
type ContextCheck = Box<dyn FnOnce(&Context) -> Result<(), String> + Send>;
type ErrorCheck = Box<dyn FnOnce(&FluxError) -> Result<(), String> + Send>;

enum Step<T> {
    Subscription,
    Next { expected: String, check: Check<T> },
    NextCount(u64),
    Request(u64),
    Run(Box<dyn FnOnce() + Send>),
    Await(Duration),
    NoEvent(Duration),
    Context { expected: String, check: ContextCheck },
}

enum Terminal {
    Cancel,
    Complete,
    Error { expected: String, check: ErrorCheck },
}

enum Source<T> {
    Ready(Flux<T>),
    Deferred(Box<dyn FnOnce() -> Flux<T> + Send>),
}

/// Builder of an ordered script of expectations for one subscription.
///
/// ```
/// use std::time::Duration;
/// use rivulet::Flux;
/// use rivulet::testing::StepVerifier;
///
/// StepVerifier::with_virtual_time(|| Flux::range(1, 2).delay_elements(Duration::from_secs(3600)))
///     .expect_subscription()
///     .expect_no_event(Duration::from_secs(3600))
///     .expect_next(1)
///     .then_await(Duration::from_secs(3600))
///     .expect_next(2)
///     .verify_complete()
///     .unwrap();
/// ```
pub struct StepVerifier<T> {
    source: Source<T>,
    options: StepVerifierOptions,
    steps: Vec<Step<T>>,
}

impl<T: Item + Debug> StepVerifier<T> {
    /// Verifies `flux` with an unbounded initial request.
    pub fn create(flux: Flux<T>) -> Self {
        Self::create_with_options(flux, StepVerifierOptions::default())
    }

    /// Verifies `flux` with an initial request of `n` (`0` = none).
    pub fn create_with_demand(flux: Flux<T>, n: u64) -> Self {
        let options = StepVerifierOptions {
            initial_request: n,
            ..StepVerifierOptions::default()
        };
        Self::create_with_options(flux, options)
    }

    /// Verifies `flux` with explicit options.
    pub fn create_with_options(flux: Flux<T>, options: StepVerifierOptions) -> Self {
        Self {
            source: Source::Ready(flux),
            options,
            steps: Vec::new(),
        }
    }

    /// Verifies the flux built by `supplier` on a fresh virtual clock.
    pub fn with_virtual_time(supplier: impl FnOnce() -> Flux<T> + Send + 'static) -> Self {
        Self::with_virtual_time_and_demand(supplier, UNBOUNDED)
    }

    /// Like [`with_virtual_time`](Self::with_virtual_time) with an initial
    /// request of `n`.
    pub fn with_virtual_time_and_demand(
        supplier: impl FnOnce() -> Flux<T> + Send + 'static,
        n: u64,
    ) -> Self {
        Self {
            source: Source::Deferred(Box::new(supplier)),
            options: StepVerifierOptions {
                initial_request: n,
                virtual_time: true,
                ..StepVerifierOptions::default()
            },
            steps: Vec::new(),
        }
    }

    fn step(mut self, step: Step<T>) -> Self {
        self.steps.push(step);
        self
    }

    /// Expects `on_subscribe`.
    pub fn expect_subscription(self) -> Self {
        self.step(Step::Subscription)
    }

    /// Expects the next item to satisfy `predicate`.
    pub fn expect_next_matches(self, predicate: impl FnOnce(&T) -> bool + Send + 'static) -> Self {
        self.step(Step::Next {
            expected: "on_next matching predicate".to_string(),
            check: Box::new(move |v: T| {
                if predicate(&v) {
                    Ok(())
                } else {
                    Err(format!("predicate rejected {v:?}"))
                }
            }),
        })
    }

    /// Hands the next item to `consumer`, which may assert on it.
    pub fn consume_next_with(self, consumer: impl FnOnce(T) + Send + 'static) -> Self {
        self.step(Step::Next {
            expected: "on_next".to_string(),
            check: Box::new(move |v: T| {
                consumer(v);
                Ok(())
            }),
        })
    }

    /// Expects `n` items, whatever their values.
    pub fn expect_next_count(self, n: u64) -> Self {
        self.step(Step::NextCount(n))
    }

    /// Requests `n` more items.
    pub fn then_request(self, n: u64) -> Self {
        self.step(Step::Request(n))
    }

    /// Runs `task` at this point of the script.
    pub fn then(self, task: impl FnOnce() + Send + 'static) -> Self {
        self.step(Step::Run(Box::new(task)))
    }

    /// Advances the virtual clock by `duration`, or sleeps without one.
    pub fn then_await(self, duration: Duration) -> Self {
        self.step(Step::Await(duration))
    }

    /// Expects no signal during `duration`.
    pub fn expect_no_event(self, duration: Duration) -> Self {
        self.step(Step::NoEvent(duration))
    }

    /// Starts expectations on the context the verifier subscribed with.
    pub fn expect_accessible_context(self) -> ContextExpectations<T> {
        ContextExpectations {
            verifier: self,
            checks: Vec::new(),
        }
    }

    /// Expects the subscription context to hold no visible entry.
    pub fn expect_no_accessible_context(self) -> Self {
        self.step(Step::Context {
            expected: "no accessible context".to_string(),
            check: Box::new(|cx: &Context| {
                if cx.is_empty() {
                    Ok(())
                } else {
                    Err(format!("found keys {:?}", cx.keys()))
                }
            }),
        })
    }

    fn finish(self, terminal: Terminal) -> Verification<T> {
        Verification {
            verifier: self,
            terminal,
        }
    }

    fn expect_error_with(self, expected: String, check: ErrorCheck) -> Verification<T> {
        self.finish(Terminal::Error { expected, check })
    }

    /// Cancels the subscription as the last step.
    pub fn then_cancel(self) -> Verification<T> {
        self.finish(Terminal::Cancel)
    }

    /// Expects completion.
    pub fn expect_complete(self) -> Verification<T> {
        self.finish(Terminal::Complete)
    }

    /// Expects any error.
    pub fn expect_error(self) -> Verification<T> {
        self.expect_error_with("on_error".to_string(), Box::new(|_| Ok(())))
    }

    /// Expects an error wrapping a user error of type `E`.
    pub fn expect_error_of<E: StdError + 'static>(self) -> Verification<T> {
        let name = std::any::type_name::<E>();
        self.expect_error_with(
            format!("on_error of {name}"),
            Box::new(move |e: &FluxError| match e.downcast_ref::<E>() {
                Some(_) => Ok(()),
                None => Err(format!("{e} is not a {name}")),
            }),
        )
    }

    /// Expects an error whose message is `message`.
    pub fn expect_error_message(self, message: impl Into<String>) -> Verification<T> {
        let message = message.into();
        self.expect_error_with(
            format!("on_error({message})"),
            Box::new(move |e: &FluxError| {
                let actual = e.to_string();
                if actual == message {
                    Ok(())
                } else {
                    Err(format!("message was {actual:?}"))
                }
            }),
        )
    }

    /// Expects an error satisfying `predicate`.
    pub fn expect_error_matches(
        self,
        predicate: impl FnOnce(&FluxError) -> bool + Send + 'static,
    ) -> Verification<T> {
        self.expect_error_with(
            "on_error matching predicate".to_string(),
            Box::new(move |e: &FluxError| {
                if predicate(e) {
                    Ok(())
                } else {
                    Err(format!("predicate rejected {e}"))
                }
            }),
        )
    }

    /// Expects a [`FluxError::Timeout`].
    pub fn expect_timeout(self) -> Verification<T> {
        self.expect_error_with(
            "on_error(timeout)".to_string(),
            Box::new(|e: &FluxError| {
                if e.is_timeout() {
                    Ok(())
                } else {
                    Err(format!("{e} is not a timeout"))
                }
            }),
        )
    }

    /// Shorthand for `expect_complete().verify()`.
    pub fn verify_complete(self) -> Result<Duration, VerifyError> {
        self.expect_complete().verify()
    }

    /// Shorthand for `expect_error().verify()`.
    pub fn verify_error(self) -> Result<Duration, VerifyError> {
        self.expect_error().verify()
    }
}

impl<T: Item + Debug + PartialEq> StepVerifier<T> {
    /// Expects the next item to equal `value`.
    pub fn expect_next(self, value: T) -> Self {
        self.step(Step::Next {
            expected: format!("on_next({value:?})"),
            check: Box::new(move |v: T| {
                if v == value {
                    Ok(())
                } else {
                    Err(format!("got {v:?}"))
                }
            }),
        })
    }

    /// Expects the given items, in order.
    pub fn expect_next_sequence(self, values: impl IntoIterator<Item = T>) -> Self {
        values.into_iter().fold(self, |verifier, v| verifier.expect_next(v))
    }
}

/// Context checks started by [`StepVerifier::expect_accessible_context`].
pub struct ContextExpectations<T> {
    verifier: StepVerifier<T>,
    checks: Vec<ContextCheck>,
}

impl<T: Item + Debug> ContextExpectations<T> {
    /// Expects `key` to be bound.
    pub fn has_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.checks.push(Box::new(move |cx: &Context| {
            if cx.has_key(&key) {
                Ok(())
            } else {
                Err(format!("key {key:?} missing"))
            }
        }));
        self
    }

    /// Expects `key` to be bound to `value`.
    pub fn contains<V>(mut self, key: impl Into<String>, value: V) -> Self
    where
        V: Any + PartialEq + Debug + Send,
    {
        let key = key.into();
        self.checks.push(Box::new(move |cx: &Context| match cx.get::<V>(&key) {
            Some(actual) if *actual == value => Ok(()),
            Some(actual) => Err(format!("{key:?} is {actual:?}, expected {value:?}")),
            None => Err(format!("{key:?} is not bound to a {}", std::any::type_name::<V>())),
        }));
        self
    }

    /// Runs `assertion` against the context; it may panic.
    pub fn assert_that(mut self, assertion: impl FnOnce(&Context) + Send + 'static) -> Self {
        self.checks.push(Box::new(move |cx: &Context| {
            assertion(cx);
            Ok(())
        }));
        self
    }

    /// Returns to the main script.
    pub fn then(self) -> StepVerifier<T> {
        let checks = self.checks;
        self.verifier.step(Step::Context {
            expected: "accessible context".to_string(),
            check: Box::new(move |cx: &Context| checks.into_iter().try_for_each(|check| check(cx))),
        })
    }
}

/// A script ending in a terminal expectation, ready to run.
pub struct Verification<T> {
    verifier: StepVerifier<T>,
    terminal: Terminal,
}

impl<T: Item + Debug> Verification<T> {
    /// Runs the script; returns the wall-clock duration on success.
    pub fn verify(self) -> Result<Duration, VerifyError> {
        self.run().map(|assertions| assertions.elapsed)
    }

    /// Runs the script and returns post-run assertions on dropped signals.
    pub fn verify_then_assert_that(self) -> Result<Assertions, VerifyError> {
        self.run()
    }

    fn run(self) -> Result<Assertions, VerifyError> {
        let StepVerifier {
            source,
            options,
            steps,
        } = self.verifier;
        let started = Instant::now();

        let dropped = Arc::new(Dropped::default());
        let (on_next, on_error) = (Arc::clone(&dropped), Arc::clone(&dropped));
        let mut cx = hooks::with_dropped_hooks(
            &options.context,
            move |item| on_next.items.lock().push(item),
            move |error| on_error.errors.lock().push(error),
        );
        let clock = options.virtual_time.then(VirtualTimeScheduler::new);
        if let Some(vts) = &clock {
            cx = cx.put_reserved(keys::VIRTUAL_TIME, vts.clone());
        }
        let flux = match source {
            Source::Ready(flux) => flux,
            Source::Deferred(supplier) => supplier(),
        };

        let recorder = Arc::new(Recorder {
            state: Mutex::new(Recorded {
                subscribed: false,
                subscription: None,
                events: VecDeque::new(),
            }),
            arrived: Condvar::new(),
        });
        tracing::debug!(
            steps = steps.len(),
            virtual_time = clock.is_some(),
            "verifier: verifying"
        );
        flux.subscribe_with_context(
            RecordingSubscriber {
                recorder: Arc::clone(&recorder),
                initial_request: options.initial_request,
            },
            cx,
        );

        let mut run = Run {
            recorder,
            clock,
            timeout: options.verify_timeout,
            context: options.context,
            step: 0,
        };
        let outcome = run.steps(steps).and_then(|()| run.terminal(self.terminal));
        if outcome.is_err() {
            run.cancel();
        }
        if let Some(vts) = &run.clock {
            vts.dispose();
        }
        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => {
                tracing::debug!(?elapsed, "verifier: completed");
                let items = std::mem::take(&mut *dropped.items.lock());
                let errors = std::mem::take(&mut *dropped.errors.lock());
                Ok(Assertions {
                    items,
                    errors,
                    elapsed,
                })
            }
            Err(e) => {
                tracing::debug!(error = %e, "verifier: failed");
                Err(e)
            }
        }
    }
}

struct Run<T> {
    recorder: Arc<Recorder<T>>,
    clock: Option<VirtualTimeScheduler>,
    timeout: Option<Duration>,
    context: Context,
    step: usize,
}

impl<T: Item + Debug> Run<T> {
    fn wait_for<R>(
        &self,
        expected: &str,
        mut take: impl FnMut(&mut Recorded<T>) -> Option<R>,
    ) -> Result<R, VerifyError> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut state = self.recorder.state.lock();
        loop {
            if let Some(found) = take(&mut state) {
                return Ok(found);
            }
            match deadline {
                None => self.recorder.arrived.wait(&mut state),
                Some(deadline) => {
                    if self.recorder.arrived.wait_until(&mut state, deadline).timed_out() {
                        return take(&mut state).ok_or_else(|| VerifyError::Timeout {
                            step: self.step,
                            expected: expected.to_string(),
                            waited: self.timeout.unwrap_or_default(),
                        });
                    }
                }
            }
        }
    }

    fn next_event(&self, expected: &str) -> Result<Event<T>, VerifyError> {
        self.wait_for(expected, |state| state.events.pop_front())
    }

    fn mismatch(&self, expected: &str, actual: &Event<T>) -> VerifyError {
        VerifyError::Mismatch {
            step: self.step,
            expected: expected.to_string(),
            actual: describe(actual),
        }
    }

    fn expect_item(&self, expected: &str) -> Result<T, VerifyError> {
        match self.next_event(expected)? {
            Event::Next(v) => Ok(v),
            other => Err(self.mismatch(expected, &other)),
        }
    }

    fn advance(&self, duration: Duration) {
        match &self.clock {
            Some(vts) => vts.advance_time_by(duration),
            None => std::thread::sleep(duration),
        }
    }

    fn assert_quiet(&self, duration: Duration) -> Result<(), VerifyError> {
        let state = self.recorder.state.lock();
        match state.events.front() {
            Some(event) => Err(self.mismatch(&format!("no signal for {duration:?}"), event)),
            None => Ok(()),
        }
    }

    fn no_event(&self, duration: Duration) -> Result<(), VerifyError> {
        let Some(vts) = &self.clock else {
            std::thread::sleep(duration);
            return self.assert_quiet(duration);
        };
        if duration.is_zero() {
            return self.assert_quiet(duration);
        }
        let tick = Duration::from_nanos(1);
        vts.advance_time_by(duration - tick);
        self.assert_quiet(duration)?;
        vts.advance_time_by(tick);
        Ok(())
    }

    fn steps(&mut self, steps: Vec<Step<T>>) -> Result<(), VerifyError> {
        for step in steps {
            self.step += 1;
            let index = self.step;
            match step {
                Step::Subscription => {
                    self.wait_for("on_subscribe", |state| state.subscribed.then_some(()))?;
                }
                Step::Next { expected, check } => {
                    let v = self.expect_item(&expected)?;
                    check(v).map_err(|message| VerifyError::Assertion {
                        step: index,
                        expected,
                        message,
                    })?;
                }
                Step::NextCount(n) => {
                    for i in 1..=n {
                        self.expect_item(&format!("on_next #{i} of {n}"))?;
                    }
                }
                Step::Request(n) => {
                    let subscription =
                        self.wait_for("on_subscribe", |state| state.subscription.clone())?;
                    subscription.request(n);
                }
                Step::Run(task) => task(),
                Step::Await(duration) => self.advance(duration),
                Step::NoEvent(duration) => self.no_event(duration)?,
                Step::Context { expected, check } => {
                    check(&self.context).map_err(|message| VerifyError::Assertion {
                        step: index,
                        expected,
                        message,
                    })?;
                }
            }
        }
        Ok(())
    }

    fn terminal(&mut self, terminal: Terminal) -> Result<(), VerifyError> {
        self.step += 1;
        match terminal {
            Terminal::Cancel => {
                let subscription =
                    self.wait_for("on_subscribe", |state| state.subscription.clone())?;
                subscription.cancel();
                Ok(())
            }
            Terminal::Complete => match self.next_event("on_complete")? {
                Event::Complete => self.no_trailing(),
                other => Err(self.mismatch("on_complete", &other)),
            },
            Terminal::Error { expected, check } => match self.next_event(&expected)? {
                Event::Error(e) => {
                    check(&e).map_err(|message| VerifyError::Assertion {
                        step: self.step,
                        expected,
                        message,
                    })?;
                    self.no_trailing()
                }
                other => Err(self.mismatch(&expected, &other)),
            },
        }
    }

    fn no_trailing(&self) -> Result<(), VerifyError> {
        let state = self.recorder.state.lock();
        match state.events.front() {
            Some(event) => Err(self.mismatch("no signal after the terminal one", event)),
            None => Ok(()),
        }
    }

    fn cancel(&self) {
        let subscription = self.recorder.state.lock().subscription.clone();
        if let Some(s) = subscription {
            s.cancel();
        }
    }
}

/// Post-run checks on signals the pipeline dropped.
pub struct Assertions {
    items: Vec<Box<dyn Any + Send>>,
    errors: Vec<FluxError>,
    elapsed: Duration,
}

impl Assertions {
    /// Wall-clock duration of the run.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    #[track_caller]
    pub fn has_not_dropped_elements(&self) -> &Self {
        assert!(
            self.items.is_empty(),
            "expected no dropped items, got {}",
            self.items.len()
        );
        self
    }

    #[track_caller]
    pub fn has_dropped_elements(&self) -> &Self {
        assert!(!self.items.is_empty(), "expected dropped items, got none");
        self
    }

    /// Asserts that every value of `expected` was among the dropped items.
    #[track_caller]
    pub fn has_dropped<V>(&self, expected: impl IntoIterator<Item = V>) -> &Self
    where
        V: Any + PartialEq + Debug,
    {
        let dropped: Vec<&V> = self
            .items
            .iter()
            .filter_map(|item| (**item).downcast_ref::<V>())
            .collect();
        for v in expected {
            assert!(
                dropped.iter().any(|d| **d == v),
                "expected {v:?} among dropped items {dropped:?}"
            );
        }
        self
    }

    #[track_caller]
    pub fn has_not_dropped_errors(&self) -> &Self {
        assert!(
            self.errors.is_empty(),
            "expected no dropped errors, got {:?}",
            self.errors
        );
        self
    }

    #[track_caller]
    pub fn has_dropped_errors(&self) -> &Self {
        assert!(!self.errors.is_empty(), "expected dropped errors, got none");
        self
    }

    #[track_caller]
    pub fn took_less_than(&self, limit: Duration) -> &Self {
        assert!(
            self.elapsed < limit,
            "expected the run to take less than {limit:?}, took {:?}",
            self.elapsed
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_is_reported() {
        let err = StepVerifier::create(Flux::range(1, 2))
            .expect_next(1)
            .expect_next(3)
            .verify_complete()
            .unwrap_err();
        assert_eq!(err.as_label(), "verify_assertion");
        assert!(err.to_string().contains("step 2"));
    }

    #[test]
    fn test_unexpected_completion() {
        let err = StepVerifier::create(Flux::just(1))
            .expect_next(1)
            .expect_next(2)
            .verify_complete()
            .unwrap_err();
        assert_eq!(err.as_label(), "verify_mismatch");
    }

    #[test]
    fn test_signal_inside_quiet_window_fails() {
        let err = StepVerifier::with_virtual_time(|| Flux::timer(Duration::from_secs(5)))
            .expect_no_event(Duration::from_secs(6))
            .expect_next(0)
            .verify_complete()
            .unwrap_err();
        assert_eq!(err.as_label(), "verify_mismatch");
    }

    #[test]
    fn test_missing_signal_times_out() {
        let options = StepVerifierOptions {
            verify_timeout: Some(Duration::from_millis(20)),
            ..StepVerifierOptions::default()
        };
        let err = StepVerifier::create_with_options(Flux::<i32>::never(), options)
            .expect_next(1)
            .then_cancel()
            .verify()
            .unwrap_err();
        assert_eq!(err.as_label(), "verify_timeout");
    }

    #[test]
    fn test_accessible_context() {
        let options = StepVerifierOptions {
            context: Context::of("tenant", "acme"),
            ..StepVerifierOptions::default()
        };
        StepVerifier::create_with_options(Flux::just(1), options)
            .expect_accessible_context()
            .has_key("tenant")
            .contains("tenant", "acme")
            .assert_that(|cx| assert_eq!(cx.len(), 1))
            .then()
            .expect_next(1)
            .verify_complete()
            .unwrap();

        StepVerifier::create(Flux::just(1))
            .expect_no_accessible_context()
            .expect_next(1)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_error_expectations() {
        StepVerifier::create(Flux::<i32>::error(FluxError::domain(std::io::Error::other("io"))))
            .expect_error_of::<std::io::Error>()
            .verify()
            .unwrap();
        StepVerifier::create(Flux::<i32>::error(FluxError::msg("x")))
            .verify_error()
            .unwrap();
    }

    #[test]
    fn test_virtual_time_is_fast() {
        StepVerifier::with_virtual_time(|| Flux::timer(Duration::from_secs(86_400)))
            .then_await(Duration::from_secs(86_400))
            .expect_next(0)
            .expect_complete()
            .verify_then_assert_that()
            .unwrap()
            .took_less_than(Duration::from_secs(5))
            .has_not_dropped_errors();
    }

    #[test]
    fn test_consume_and_match() {
        StepVerifier::create(Flux::from_iter(vec!["ab", "cde"]))
            .consume_next_with(|v| assert_eq!(v.len(), 2))
            .expect_next_matches(|v| v.starts_with('c'))
            .verify_complete()
            .unwrap();
    }
}
