//! # Protocol boundary for user subscribers.
//!
//! [`StrictSubscriber`] sits between a pipeline and a subscriber supplied
//! through [`Flux::subscribe_with`](crate::Flux::subscribe_with). It enforces
//! the rules a hand-written producer may break:
//!
//! ## Rules
//! - **subscribe-once**: a second `on_subscribe` is cancelled and reported.
//! - **backpressure**: an item without outstanding demand cancels upstream and
//!   terminates the subscriber with [`FluxError::Protocol`].
//! - **terminal-once**: signals after a terminal signal (or after cancel) are
//!   routed to the dropped-signal hooks instead of the subscriber.
//! - **positive request**: `request(0)` cancels upstream and is reported as an
//!   unhandled protocol error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::subscription::{add_demand, produced};
use super::{BoxSubscriber, Signal, Subscriber, Subscription, SubscriptionRef};
use crate::context::Context;
use crate::error::FluxError;
use crate::hooks;

struct StrictSubscription {
    upstream: Mutex<Option<SubscriptionRef>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
}

impl Subscription for StrictSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            let err = FluxError::protocol("positive_request", "request(0) is not allowed");
            tracing::error!(error = %err, "protocol violation by subscriber");
            hooks::unhandled_error(&err);
            self.cancel();
            return;
        }
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        add_demand(&self.requested, n);
        let upstream = self.upstream.lock().clone();
        if let Some(s) = upstream {
            s.request(n);
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let upstream = self.upstream.lock().clone();
        if let Some(s) = upstream {
            s.cancel();
        }
    }
}

/// Subscriber wrapper enforcing the signal protocol.
pub(crate) struct StrictSubscriber<T> {
    actual: BoxSubscriber<T>,
    shared: Arc<StrictSubscription>,
    cx: Context,
    subscribed: bool,
    done: bool,
}

impl<T> StrictSubscriber<T> {
    pub(crate) fn new(actual: BoxSubscriber<T>, cx: Context) -> Self {
        Self {
            actual,
            shared: Arc::new(StrictSubscription {
                upstream: Mutex::new(None),
                requested: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
            }),
            cx,
            subscribed: false,
            done: false,
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for StrictSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.subscribed {
            subscription.cancel();
            tracing::error!(rule = "subscribe_once", "on_subscribe called twice; second subscription cancelled");
            return;
        }
        self.subscribed = true;
        *self.shared.upstream.lock() = Some(subscription);
        self.actual.on_subscribe(self.shared.clone());
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        if self.done || self.shared.cancelled.load(Ordering::Acquire) {
            match signal {
                Signal::Next(v) => hooks::on_next_dropped(v, &self.cx),
                Signal::Error(e) => hooks::on_error_dropped(e, &self.cx),
                Signal::Complete => {
                    tracing::debug!("completion dropped after termination");
                }
            }
            return;
        }
        match signal {
            Signal::Next(v) => {
                if self.shared.requested.load(Ordering::Acquire) == 0 {
                    self.done = true;
                    self.shared.cancel();
                    let err =
                        FluxError::protocol("backpressure", "item emitted without outstanding demand");
                    tracing::error!(error = %err, "protocol violation by producer");
                    hooks::on_next_dropped(v, &self.cx);
                    self.actual.on_signal(Signal::Error(err));
                    return;
                }
                produced(&self.shared.requested, 1);
                self.actual.on_signal(Signal::Next(v));
            }
            terminal => {
                self.done = true;
                self.actual.on_signal(terminal);
            }
        }
    }
}
