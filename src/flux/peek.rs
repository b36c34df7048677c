//! # Side-effect operators.
//!
//! `do_on_*` callbacks observe signals without changing them. They run on
//! the thread delivering the signal, before it is forwarded, except
//! `do_finally` which runs once, after the terminal signal or cancellation
//! has been propagated.
//!
//! `do_first` is the odd one out: it runs on the subscribing thread before
//! the upstream is subscribed at all. Stacked `do_first` stages run in
//! reverse declaration order, outermost first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Flux, Item};
use crate::error::FluxError;
use crate::protocol::{BoxSubscriber, Signal, SignalType, Subscriber, Subscription, SubscriptionRef};

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Callbacks installed by one peek stage.
pub(super) struct Peek<T> {
    pub(super) on_subscribe: Option<Hook>,
    pub(super) on_request: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    pub(super) on_next: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    pub(super) on_error: Option<Arc<dyn Fn(&FluxError) + Send + Sync>>,
    pub(super) on_complete: Option<Hook>,
    pub(super) on_cancel: Option<Hook>,
    pub(super) on_finally: Option<Arc<dyn Fn(SignalType) + Send + Sync>>,
}

impl<T> Default for Peek<T> {
    fn default() -> Self {
        Self {
            on_subscribe: None,
            on_request: None,
            on_next: None,
            on_error: None,
            on_complete: None,
            on_cancel: None,
            on_finally: None,
        }
    }
}

impl<T> Peek<T> {
    fn finally(&self, fired: &AtomicBool, kind: SignalType) {
        if let Some(f) = &self.on_finally {
            if !fired.swap(true, Ordering::AcqRel) {
                f(kind);
            }
        }
    }
}

struct PeekSubscription<T> {
    upstream: SubscriptionRef,
    hooks: Arc<Peek<T>>,
    fired: Arc<AtomicBool>,
}

impl<T: Item> Subscription for PeekSubscription<T> {
    fn request(&self, n: u64) {
        if let Some(f) = &self.hooks.on_request {
            f(n);
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        if let Some(f) = &self.hooks.on_cancel {
            f();
        }
        self.upstream.cancel();
        self.hooks.finally(&self.fired, SignalType::Cancel);
    }
}

struct PeekSubscriber<T> {
    actual: BoxSubscriber<T>,
    hooks: Arc<Peek<T>>,
    fired: Arc<AtomicBool>,
}

impl<T: Item> Subscriber<T> for PeekSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if let Some(f) = &self.hooks.on_subscribe {
            f();
        }
        let wrapped = PeekSubscription {
            upstream: subscription,
            hooks: Arc::clone(&self.hooks),
            fired: Arc::clone(&self.fired),
        };
        self.actual.on_subscribe(Arc::new(wrapped));
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match &signal {
            Signal::Next(v) => {
                if let Some(f) = &self.hooks.on_next {
                    f(v);
                }
                self.actual.on_signal(signal);
            }
            Signal::Error(e) => {
                if let Some(f) = &self.hooks.on_error {
                    f(e);
                }
                self.actual.on_signal(signal);
                self.hooks.finally(&self.fired, SignalType::OnError);
            }
            Signal::Complete => {
                if let Some(f) = &self.hooks.on_complete {
                    f();
                }
                self.actual.on_signal(signal);
                self.hooks.finally(&self.fired, SignalType::OnComplete);
            }
        }
    }
}

impl<T: Item> Flux<T> {
    pub(super) fn peek(self, hooks: Peek<T>) -> Flux<T> {
        let hooks = Arc::new(hooks);
        Flux::from_fn(move |sub, cx| {
            let peek = PeekSubscriber {
                actual: sub,
                hooks: Arc::clone(&hooks),
                fired: Arc::new(AtomicBool::new(false)),
            };
            self.subscribe_inner(Box::new(peek), cx);
        })
    }

    /// Calls `f` with every item before it is forwarded.
    pub fn do_on_next(self, f: impl Fn(&T) + Send + Sync + 'static) -> Flux<T> {
        self.peek(Peek {
            on_next: Some(Arc::new(f)),
            ..Peek::default()
        })
    }

    /// Calls `f` with the error before it is forwarded.
    pub fn do_on_error(self, f: impl Fn(&FluxError) + Send + Sync + 'static) -> Flux<T> {
        self.peek(Peek {
            on_error: Some(Arc::new(f)),
            ..Peek::default()
        })
    }

    /// Calls `f` before completion is forwarded.
    pub fn do_on_complete(self, f: impl Fn() + Send + Sync + 'static) -> Flux<T> {
        self.peek(Peek {
            on_complete: Some(Arc::new(f)),
            ..Peek::default()
        })
    }

    /// Calls `f` when the upstream subscription is handed down.
    pub fn do_on_subscribe(self, f: impl Fn() + Send + Sync + 'static) -> Flux<T> {
        self.peek(Peek {
            on_subscribe: Some(Arc::new(f)),
            ..Peek::default()
        })
    }

    /// Calls `f` with every request amount travelling upstream.
    pub fn do_on_request(self, f: impl Fn(u64) + Send + Sync + 'static) -> Flux<T> {
        self.peek(Peek {
            on_request: Some(Arc::new(f)),
            ..Peek::default()
        })
    }

    /// Calls `f` when the downstream cancels.
    pub fn do_on_cancel(self, f: impl Fn() + Send + Sync + 'static) -> Flux<T> {
        self.peek(Peek {
            on_cancel: Some(Arc::new(f)),
            ..Peek::default()
        })
    }

    /// Calls `f` at subscribe time, before anything upstream is subscribed.
    pub fn do_first(self, f: impl Fn() + Send + Sync + 'static) -> Flux<T> {
        Flux::from_fn(move |sub, cx| {
            f();
            self.subscribe_inner(sub, cx);
        })
    }

    /// Calls `f` once per subscription with what ended it: `OnComplete`,
    /// `OnError` or `Cancel`.
    pub fn do_finally(self, f: impl Fn(SignalType) + Send + Sync + 'static) -> Flux<T> {
        self.peek(Peek {
            on_finally: Some(Arc::new(f)),
            ..Peek::default()
        })
    }
}
