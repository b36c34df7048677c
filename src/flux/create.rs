//! # Callback-driven source.
//!
//! [`Flux::create`] bridges push-style APIs (listeners, callbacks, other
//! threads) into a pipeline. The [`FluxSink`] buffers items pushed faster
//! than the subscriber requests them.
//!
//! ```text
//! producer thread(s) ──sink.next(v)──► [buffer] ──drain (demand-gated)──► subscriber
//!                     sink.complete() ─────────► terminal after buffer is empty
//! ```
//!
//! ## Rules
//! - `next` after `complete`/`error` is dropped and reported through the hooks.
//! - Errors are delivered after already buffered items.
//! - After cancel the buffer is discarded and `next` becomes a no-op.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Flux, Item};
use crate::context::Context;
use crate::error::FluxError;
use crate::hooks;
use crate::protocol::{add_demand, produced, BoxSubscriber, Signal, Subscription, WorkInProgress};

type RequestHook = Arc<dyn Fn(u64) + Send + Sync>;
type CancelHook = Box<dyn FnOnce() + Send>;

struct SinkState<T> {
    queue: VecDeque<T>,
    done: Option<Option<FluxError>>,
}

struct SinkInner<T> {
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    state: Mutex<SinkState<T>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    wip: WorkInProgress,
    on_request: Mutex<Option<RequestHook>>,
    on_cancel: Mutex<Option<CancelHook>>,
    cx: Context,
}

impl<T: Item> SinkInner<T> {
    fn drain_once(&self) {
        let mut guard = self.downstream.lock();
        if guard.is_none() {
            return;
        }
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                guard.take();
                let mut st = self.state.lock();
                st.queue.clear();
                return;
            }
            let next = {
                let mut st = self.state.lock();
                let item = if self.requested.load(Ordering::Acquire) > 0 {
                    st.queue.pop_front()
                } else {
                    None
                };
                match item {
                    Some(v) => Some(Signal::Next(v)),
                    None if st.queue.is_empty() => match &st.done {
                        Some(None) => Some(Signal::Complete),
                        Some(Some(e)) => Some(Signal::Error(e.clone())),
                        None => None,
                    },
                    None => None,
                }
            };
            match next {
                Some(Signal::Next(v)) => {
                    produced(&self.requested, 1);
                    if let Some(sub) = guard.as_mut() {
                        sub.on_signal(Signal::Next(v));
                    }
                }
                Some(terminal) => {
                    if let Some(mut sub) = guard.take() {
                        drop(guard);
                        sub.on_signal(terminal);
                    }
                    return;
                }
                None => return,
            }
        }
    }
}

impl<T: Item> Subscription for SinkInner<T> {
    fn request(&self, n: u64) {
        if n == 0 || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        add_demand(&self.requested, n);
        let hook = self.on_request.lock().clone();
        if let Some(hook) = hook {
            hook(n);
        }
        self.wip.drain(|| self.drain_once());
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hook) = self.on_cancel.lock().take() {
            hook();
        }
        self.wip.drain(|| self.drain_once());
    }
}

/// Push-side handle of [`Flux::create`]. Clone it to push from several threads;
/// pushes are serialized.
pub struct FluxSink<T> {
    inner: Arc<SinkInner<T>>,
}

impl<T> Clone for FluxSink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Item> FluxSink<T> {
    /// Pushes an item; it is emitted as soon as there is demand.
    pub fn next(&self, value: T) -> &Self {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return self;
        }
        {
            let mut st = self.inner.state.lock();
            if st.done.is_some() {
                drop(st);
                hooks::on_next_dropped(value, &self.inner.cx);
                return self;
            }
            st.queue.push_back(value);
        }
        self.inner.wip.drain(|| self.inner.drain_once());
        self
    }

    /// Terminates with `error` once buffered items are delivered.
    pub fn error(&self, error: FluxError) {
        {
            let mut st = self.inner.state.lock();
            if st.done.is_some() {
                drop(st);
                hooks::on_error_dropped(error, &self.inner.cx);
                return;
            }
            st.done = Some(Some(error));
        }
        self.inner.wip.drain(|| self.inner.drain_once());
    }

    /// Completes once buffered items are delivered.
    pub fn complete(&self) {
        {
            let mut st = self.inner.state.lock();
            if st.done.is_some() {
                return;
            }
            st.done = Some(None);
        }
        self.inner.wip.drain(|| self.inner.drain_once());
    }

    /// Outstanding demand not yet satisfied by emitted items.
    pub fn requested_from_downstream(&self) -> u64 {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Registers a callback for every `request(n)`. Called at once with the
    /// current demand if some is already outstanding.
    pub fn on_request(&self, hook: impl Fn(u64) + Send + Sync + 'static) -> &Self {
        let hook: RequestHook = Arc::new(hook);
        *self.inner.on_request.lock() = Some(Arc::clone(&hook));
        let outstanding = self.requested_from_downstream();
        if outstanding > 0 {
            hook(outstanding);
        }
        self
    }

    /// Registers a callback run once when the subscriber cancels.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> &Self {
        if self.is_cancelled() {
            hook();
            return self;
        }
        *self.inner.on_cancel.lock() = Some(Box::new(hook));
        self
    }

    /// True once the subscriber cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Context of the subscription.
    pub fn context(&self) -> &Context {
        &self.inner.cx
    }
}

impl<T: Item> Flux<T> {
    /// Builds a source from a callback that pushes into a [`FluxSink`].
    ///
    /// ```
    /// use rivulet::Flux;
    ///
    /// let flux = Flux::create(|sink| {
    ///     for i in 0..3 {
    ///         sink.next(i);
    ///     }
    ///     sink.complete();
    /// });
    /// assert_eq!(flux.collect_blocking(None).unwrap(), vec![0, 1, 2]);
    /// ```
    pub fn create<F>(emitter: F) -> Self
    where
        F: Fn(FluxSink<T>) + Send + Sync + 'static,
    {
        Self::from_fn(move |mut sub, cx| {
            let inner = Arc::new(SinkInner {
                downstream: Mutex::new(None),
                state: Mutex::new(SinkState {
                    queue: VecDeque::new(),
                    done: None,
                }),
                requested: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                wip: WorkInProgress::new(),
                on_request: Mutex::new(None),
                on_cancel: Mutex::new(None),
                cx,
            });
            inner.wip.enter();
            sub.on_subscribe(inner.clone());
            *inner.downstream.lock() = Some(sub);
            inner.wip.run(|| inner.drain_once());
            emitter(FluxSink { inner });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StepVerifier;
    use std::time::Duration;

    #[test]
    fn test_buffers_until_requested() {
        let flux = Flux::create(|sink| {
            sink.next(1).next(2).next(3);
            sink.complete();
        });
        StepVerifier::create_with_demand(flux, 1)
            .expect_next(1)
            .expect_no_event(Duration::from_millis(20))
            .then_request(2)
            .expect_next_sequence([2, 3])
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_push_from_another_thread() {
        let flux = Flux::create(|sink| {
            std::thread::spawn(move || {
                for i in 0..100 {
                    sink.next(i);
                }
                sink.complete();
            });
        });
        StepVerifier::create(flux)
            .expect_next_count(100)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_next_after_complete_is_dropped() {
        let flux = Flux::create(|sink| {
            sink.next("a");
            sink.complete();
            sink.next("late");
            sink.error(FluxError::msg("late error"));
        });
        let assertions = StepVerifier::create(flux)
            .expect_next("a")
            .expect_complete()
            .verify_then_assert_that()
            .unwrap();
        assertions
            .has_dropped_elements()
            .has_dropped_errors()
            .has_dropped(["late"]);
    }

    #[test]
    fn test_on_request_and_cancel_hooks() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (r, c) = (requests.clone(), cancelled.clone());
        let flux = Flux::<i32>::create(move |sink| {
            let r = r.clone();
            let c = c.clone();
            sink.on_request(move |n| r.lock().push(n));
            sink.on_cancel(move || c.store(true, Ordering::SeqCst));
        });
        StepVerifier::create_with_demand(flux, 3)
            .then_request(4)
            .then_cancel()
            .verify()
            .unwrap();
        assert_eq!(*requests.lock(), vec![3, 4]);
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
