//! # Scheduler shifts.
//!
//! ```text
//!             subscribe_on(A)                 publish_on(B)
//! source ◄── subscription + requests on A ──► op ──► queue ──drain on B──► downstream
//! ```
//!
//! - `subscribe_on` moves the subscribe call and every later `request` onto
//!   a worker. Nested occurrences compose so that the one nearest the source
//!   decides where production runs.
//! - `publish_on` moves signal delivery from that point on onto a worker,
//!   buffering up to `prefetch` items. Each occurrence shifts again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Flux, Item};
use crate::config::Config;
use crate::error::FluxError;
use crate::protocol::{
    add_demand, produced, BoxSubscriber, EmptySubscription, Signal, Subscriber, Subscription,
    SubscriptionRef, WorkInProgress,
};
use crate::scheduler::{SchedulerRef, Worker};

struct SubscribeOnSubscription {
    upstream: SubscriptionRef,
    worker: Worker,
}

impl Subscription for SubscribeOnSubscription {
    fn request(&self, n: u64) {
        let upstream = Arc::clone(&self.upstream);
        if let Err(e) = self.worker.schedule(move || upstream.request(n)) {
            tracing::warn!(error = %e, "request dropped by disposed worker; cancelling");
            self.upstream.cancel();
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
        self.worker.dispose();
    }
}

struct SubscribeOnSubscriber<T> {
    actual: BoxSubscriber<T>,
    worker: Worker,
}

impl<T: Item> Subscriber<T> for SubscribeOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.actual.on_subscribe(Arc::new(SubscribeOnSubscription {
            upstream: subscription,
            worker: self.worker.clone(),
        }));
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        self.actual.on_signal(signal);
    }
}

struct PublishOnState<T> {
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    upstream: Mutex<Option<SubscriptionRef>>,
    queue: Mutex<VecDeque<T>>,
    terminal: Mutex<Option<Option<FluxError>>>,
    requested: AtomicU64,
    consumed: AtomicU64,
    cancelled: AtomicBool,
    wip: WorkInProgress,
    worker: Worker,
    prefetch: u64,
    limit: u64,
}

impl<T: Item> PublishOnState<T> {
    fn schedule(self: &Arc<Self>) {
        if !self.wip.enter() {
            return;
        }
        let state = Arc::clone(self);
        let scheduled = self.worker.schedule(move || state.wip.run(|| state.drain_once()));
        if let Err(e) = scheduled {
            *self.terminal.lock() = Some(Some(e));
            self.cancel_upstream();
            self.wip.run(|| self.drain_once());
        }
    }

    fn cancel_upstream(&self) {
        let upstream = self.upstream.lock().take();
        if let Some(up) = upstream {
            up.cancel();
        }
    }

    fn replenish(&self) {
        let consumed = self.consumed.fetch_add(1, Ordering::AcqRel) + 1;
        if consumed < self.limit {
            return;
        }
        self.consumed.store(0, Ordering::Release);
        let upstream = self.upstream.lock().clone();
        if let Some(up) = upstream {
            up.request(consumed);
        }
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
            let next = if self.requested.load(Ordering::Acquire) > 0 {
                self.queue.lock().pop_front()
            } else {
                None
            };
            match next {
                Some(v) => {
                    produced(&self.requested, 1);
                    if let Some(sub) = guard.as_mut() {
                        sub.on_signal(Signal::Next(v));
                    }
                    self.replenish();
                }
                None => {
                    if !self.queue.lock().is_empty() {
                        return;
                    }
                    let Some(terminal) = self.terminal.lock().take() else {
                        return;
                    };
                    let sub = guard.take();
                    drop(guard);
                    if let Some(mut sub) = sub {
                        sub.on_signal(match terminal {
                            Some(e) => Signal::Error(e),
                            None => Signal::Complete,
                        });
                    }
                    return;
                }
            }
        }
    }
}

struct PublishOnSubscription<T> {
    state: Arc<PublishOnState<T>>,
}

impl<T: Item> Subscription for PublishOnSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        add_demand(&self.state.requested, n);
        self.state.schedule();
    }

    fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.cancel_upstream();
        self.state.schedule();
    }
}

struct PublishOnSubscriber<T> {
    state: Arc<PublishOnState<T>>,
    actual: Option<BoxSubscriber<T>>,
}

impl<T: Item> Subscriber<T> for PublishOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        *self.state.upstream.lock() = Some(Arc::clone(&subscription));
        if let Some(mut actual) = self.actual.take() {
            actual.on_subscribe(Arc::new(PublishOnSubscription {
                state: Arc::clone(&self.state),
            }));
            *self.state.downstream.lock() = Some(actual);
        }
        if self.state.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        subscription.request(self.state.prefetch);
        self.state.schedule();
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(v) => self.state.queue.lock().push_back(v),
            Signal::Error(e) => *self.state.terminal.lock() = Some(Some(e)),
            Signal::Complete => *self.state.terminal.lock() = Some(None),
        }
        self.state.schedule();
    }
}

impl<T: Item> Flux<T> {
    /// Runs the subscription (and therefore production of synchronous
    /// sources) on a worker of `scheduler`.
    pub fn subscribe_on(self, scheduler: SchedulerRef) -> Flux<T> {
        Flux::from_fn(move |sub, cx| {
            let worker = scheduler.create_worker();
            let subscriber: BoxSubscriber<T> = Box::new(SubscribeOnSubscriber {
                actual: sub,
                worker: worker.clone(),
            });
            // A rejected task drops its closure, so the subscriber waits in a slot.
            let slot = Arc::new(Mutex::new(Some(subscriber)));
            let (source, pending) = (self.clone(), Arc::clone(&slot));
            let scheduled = worker.schedule(move || {
                if let Some(sub) = pending.lock().take() {
                    source.subscribe_inner(sub, cx);
                }
            });
            if let Err(e) = scheduled {
                let sub = slot.lock().take();
                if let Some(mut sub) = sub {
                    sub.on_subscribe(EmptySubscription::shared());
                    sub.on_signal(Signal::Error(e));
                }
            }
        })
    }

    /// Delivers signals from this point on through a worker of `scheduler`.
    pub fn publish_on(self, scheduler: SchedulerRef) -> Flux<T> {
        let prefetch = Config::default().prefetch_clamped() as u64;
        Flux::from_fn(move |sub, cx| {
            let state = Arc::new(PublishOnState {
                downstream: Mutex::new(None),
                upstream: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                terminal: Mutex::new(None),
                requested: AtomicU64::new(0),
                consumed: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                wip: WorkInProgress::new(),
                worker: scheduler.create_worker(),
                prefetch,
                limit: (prefetch - prefetch / 4).max(1),
            });
            let subscriber = PublishOnSubscriber {
                state,
                actual: Some(sub),
            };
            self.subscribe_inner(Box::new(subscriber), cx);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UNBOUNDED;
    use crate::scheduler::{Scheduler, Schedulers};
    use crate::testing::StepVerifier;
    use std::time::Duration;

    fn thread_name() -> String {
        std::thread::current().name().unwrap_or_default().to_string()
    }

    #[test]
    fn test_publish_on_moves_delivery() {
        let pool = Schedulers::new_single("deliver").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let items = Flux::range(0, 3)
            .publish_on(pool.clone())
            .do_on_next(move |_| s.lock().push(thread_name()))
            .collect_blocking(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(items, vec![0, 1, 2]);
        assert!(seen.lock().iter().all(|name| name == "deliver-worker"));
        pool.dispose();
    }

    #[test]
    fn test_subscribe_on_moves_production() {
        let pool = Schedulers::new_single("produce").unwrap();
        let flux = Flux::from_callable(|| Ok::<_, std::io::Error>(thread_name())).subscribe_on(pool.clone());
        let name = flux.block_first(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(name.as_deref(), Some("produce-worker"));
        pool.dispose();
    }

    #[test]
    fn test_publish_on_honours_demand() {
        let flux = Flux::range(0, 10).publish_on(Schedulers::parallel());
        StepVerifier::create_with_demand(flux, 3)
            .expect_next_sequence([0, 1, 2])
            .expect_no_event(Duration::from_millis(50))
            .then_request(UNBOUNDED)
            .expect_next_count(7)
            .verify_complete()
            .unwrap();
    }

    #[test]
    fn test_publish_on_delivers_error_after_queued_items() {
        let flux = Flux::range(0, 2)
            .concat_with(Flux::error(FluxError::msg("late")))
            .publish_on(Schedulers::single());
        StepVerifier::create(flux)
            .expect_next_sequence([0, 1])
            .expect_error_message("late")
            .verify()
            .unwrap();
    }

    #[test]
    fn test_disposed_scheduler_rejects_subscription() {
        let pool = Schedulers::new_single("gone").unwrap();
        pool.dispose();
        StepVerifier::create(Flux::just(1).subscribe_on(pool))
            .expect_error_matches(|e| e.as_label() == "flux_rejected")
            .verify()
            .unwrap();
    }
}
