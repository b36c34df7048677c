//! # Single-outcome emitter.
//!
//! Shared by operators that produce at most one item once some event has
//! happened (`reduce`, `count`, `collect_list`, `from_callable`, `timer`).
//! The outcome may become known before or after the downstream requests;
//! the item is emitted only once both are true. Terminal outcomes without a
//! value are emitted without demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FluxError;
use crate::protocol::{BoxSubscriber, Signal, Subscription, WorkInProgress};

pub(crate) enum Outcome<T> {
    Value(T),
    Empty,
    Error(FluxError),
}

type CancelHook = Box<dyn FnOnce() + Send>;

pub(crate) struct ScalarEmitter<T> {
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    outcome: Mutex<Option<Outcome<T>>>,
    on_cancel: Mutex<Option<CancelHook>>,
    requested: AtomicBool,
    cancelled: AtomicBool,
    wip: WorkInProgress,
}

impl<T: Send + 'static> ScalarEmitter<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            downstream: Mutex::new(None),
            outcome: Mutex::new(None),
            on_cancel: Mutex::new(None),
            requested: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            wip: WorkInProgress::new(),
        })
    }

    /// Hands the emitter to `subscriber` as its subscription.
    pub(crate) fn start(self: &Arc<Self>, mut subscriber: BoxSubscriber<T>) {
        self.wip.enter();
        subscriber.on_subscribe(self.clone());
        *self.downstream.lock() = Some(subscriber);
        self.wip.run(|| self.drain_once());
    }

    /// Registers what to do on cancel; runs at once if already cancelled.
    pub(crate) fn set_on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        if self.cancelled.load(Ordering::Acquire) {
            hook();
            return;
        }
        *self.on_cancel.lock() = Some(Box::new(hook));
        if self.cancelled.load(Ordering::Acquire) {
            if let Some(h) = self.on_cancel.lock().take() {
                h();
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Publishes the outcome; only the first call counts.
    pub(crate) fn complete(&self, outcome: Outcome<T>) {
        {
            let mut slot = self.outcome.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }
        self.wip.drain(|| self.drain_once());
    }

    fn drain_once(&self) {
        let mut guard = self.downstream.lock();
        if guard.is_none() {
            return;
        }
        if self.cancelled.load(Ordering::Acquire) {
            guard.take();
            self.outcome.lock().take();
            return;
        }
        let ready = {
            let mut slot = self.outcome.lock();
            let awaiting_demand = matches!(*slot, Some(Outcome::Value(_)))
                && !self.requested.load(Ordering::Acquire);
            if awaiting_demand {
                None
            } else {
                slot.take()
            }
        };
        let Some(outcome) = ready else { return };
        let Some(mut sub) = guard.take() else { return };
        drop(guard);
        match outcome {
            Outcome::Value(v) => {
                sub.on_signal(Signal::Next(v));
                sub.on_signal(Signal::Complete);
            }
            Outcome::Empty => sub.on_signal(Signal::Complete),
            Outcome::Error(e) => sub.on_signal(Signal::Error(e)),
        }
    }
}

impl<T: Send + 'static> Subscription for ScalarEmitter<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.requested.store(true, Ordering::Release);
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
