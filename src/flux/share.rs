//! # Hot multicast.
//!
//! `share` turns a cold flux into one shared upstream subscription.
//!
//! ```text
//!                      ┌──► queue ──► subscriber A (requested 5)
//! source ──► connection┤
//!   ▲                  └──► queue ──► subscriber B (requested 2)
//!   └─ request(min over subscribers of free capacity)
//! ```
//!
//! ## Rules
//! - The first subscriber connects; later subscribers only see items emitted
//!   after they joined.
//! - Upstream demand follows the slowest subscriber, so no queue grows past
//!   what its subscriber requested.
//! - When the last subscriber cancels, the upstream is cancelled. After a
//!   terminal signal the connection resets; the next subscriber reconnects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{Flux, Item};
use crate::context::Context;
use crate::error::FluxError;
use crate::protocol::{
    add_demand, produced, BoxSubscriber, Signal, Subscriber, Subscription, SubscriptionRef,
    WorkInProgress, UNBOUNDED,
};

struct Member<T> {
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    queue: Mutex<VecDeque<T>>,
    terminal: Mutex<Option<Option<FluxError>>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    wip: WorkInProgress,
    parent: Weak<ShareState<T>>,
    id: u64,
}

impl<T: Item + Clone> Member<T> {
    /// Items this member can still take without queueing past its demand.
    fn capacity(&self) -> u64 {
        let requested = self.requested.load(Ordering::Acquire);
        if requested == UNBOUNDED {
            return UNBOUNDED;
        }
        requested.saturating_sub(self.queue.lock().len() as u64)
    }

    fn drain(&self) {
        self.wip.drain(|| self.drain_once());
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
            if let Some(v) = next {
                produced(&self.requested, 1);
                if let Some(sub) = guard.as_mut() {
                    sub.on_signal(Signal::Next(v));
                }
                continue;
            }
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

impl<T: Item + Clone> Subscription for Member<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        add_demand(&self.requested, n);
        self.drain();
        if let Some(parent) = self.parent.upgrade() {
            parent.replenish();
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.remove(self.id);
        }
        self.drain();
    }
}

struct Connection<T> {
    epoch: u64,
    connected: bool,
    upstream: Option<SubscriptionRef>,
    members: Vec<Arc<Member<T>>>,
    outstanding: u64,
}

struct ShareState<T> {
    source: Flux<T>,
    connection: Mutex<Connection<T>>,
    next_id: AtomicU64,
}

impl<T: Item + Clone> ShareState<T> {
    fn attach(self: &Arc<Self>, mut sub: BoxSubscriber<T>, cx: Context) {
        let member = Arc::new(Member {
            downstream: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            terminal: Mutex::new(None),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            wip: WorkInProgress::new(),
            parent: Arc::downgrade(self),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        });
        member.wip.enter();
        sub.on_subscribe(member.clone());
        *member.downstream.lock() = Some(sub);

        let connect = {
            let mut conn = self.connection.lock();
            if member.cancelled.load(Ordering::Acquire) {
                None
            } else {
                conn.members.push(Arc::clone(&member));
                if conn.connected {
                    None
                } else {
                    conn.connected = true;
                    conn.epoch += 1;
                    Some(conn.epoch)
                }
            }
        };
        member.wip.run(|| member.drain_once());

        match connect {
            Some(epoch) => {
                tracing::debug!(epoch, "share connecting upstream");
                let subscriber = ShareSubscriber {
                    state: Arc::clone(self),
                    epoch,
                };
                self.source.subscribe_inner(Box::new(subscriber), cx);
            }
            None => self.replenish(),
        }
    }

    fn replenish(&self) {
        let request = {
            let mut conn = self.connection.lock();
            let Some(upstream) = conn.upstream.clone() else {
                return;
            };
            let Some(min) = conn.members.iter().map(|m| m.capacity()).min() else {
                return;
            };
            if min <= conn.outstanding {
                return;
            }
            let n = if min == UNBOUNDED {
                UNBOUNDED
            } else {
                min - conn.outstanding
            };
            conn.outstanding = min;
            (upstream, n)
        };
        let (upstream, n) = request;
        upstream.request(n);
    }

    fn remove(&self, id: u64) {
        let disconnected = {
            let mut conn = self.connection.lock();
            conn.members.retain(|m| m.id != id);
            if conn.members.is_empty() && conn.connected {
                conn.connected = false;
                conn.outstanding = 0;
                conn.epoch += 1;
                Some(conn.upstream.take())
            } else {
                None
            }
        };
        match disconnected {
            Some(upstream) => {
                tracing::debug!("last share subscriber left; disconnecting upstream");
                if let Some(up) = upstream {
                    up.cancel();
                }
            }
            None => self.replenish(),
        }
    }

    /// Members of the live connection `epoch`, or `None` for stale signals.
    fn members_of(&self, epoch: u64, terminal: bool) -> Option<Vec<Arc<Member<T>>>> {
        let mut conn = self.connection.lock();
        if conn.epoch != epoch || !conn.connected {
            return None;
        }
        if terminal {
            conn.connected = false;
            conn.upstream = None;
            conn.outstanding = 0;
            return Some(std::mem::take(&mut conn.members));
        }
        if conn.outstanding != UNBOUNDED {
            conn.outstanding = conn.outstanding.saturating_sub(1);
        }
        Some(conn.members.clone())
    }
}

struct ShareSubscriber<T> {
    state: Arc<ShareState<T>>,
    epoch: u64,
}

impl<T: Item + Clone> Subscriber<T> for ShareSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let accepted = {
            let mut conn = self.state.connection.lock();
            if conn.epoch == self.epoch && conn.connected {
                conn.upstream = Some(Arc::clone(&subscription));
                true
            } else {
                false
            }
        };
        if accepted {
            self.state.replenish();
        } else {
            subscription.cancel();
        }
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(v) => {
                let Some(members) = self.state.members_of(self.epoch, false) else {
                    return;
                };
                for member in members {
                    member.queue.lock().push_back(v.clone());
                    member.drain();
                }
            }
            terminal => {
                let Some(members) = self.state.members_of(self.epoch, true) else {
                    return;
                };
                tracing::debug!(epoch = self.epoch, "share upstream terminated");
                let outcome = match terminal {
                    Signal::Error(e) => Some(e),
                    _ => None,
                };
                for member in members {
                    *member.terminal.lock() = Some(outcome.clone());
                    member.drain();
                }
            }
        }
    }
}

impl<T: Item + Clone> Flux<T> {
    /// Multicasts this flux to every concurrent subscriber through a single
    /// upstream subscription.
    pub fn share(self) -> Flux<T> {
        let state = Arc::new(ShareState {
            source: self,
            connection: Mutex::new(Connection {
                epoch: 0,
                connected: false,
                upstream: None,
                members: Vec::new(),
                outstanding: 0,
            }),
            next_id: AtomicU64::new(0),
        });
        Flux::from_fn(move |sub, cx| state.attach(sub, cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PublisherProbe, TestPublisher};

    struct Manual<T> {
        subscription: Arc<Mutex<Option<SubscriptionRef>>>,
        items: Arc<Mutex<Vec<T>>>,
    }

    impl<T: Item> Subscriber<T> for Manual<T> {
        fn on_subscribe(&mut self, subscription: SubscriptionRef) {
            *self.subscription.lock() = Some(subscription);
        }

        fn on_signal(&mut self, signal: Signal<T>) {
            if let Signal::Next(v) = signal {
                self.items.lock().push(v);
            }
        }
    }

    type Handle<T> = (Arc<Mutex<Option<SubscriptionRef>>>, Arc<Mutex<Vec<T>>>);

    fn manual<T: Item>(flux: &Flux<T>) -> Handle<T> {
        let subscription = Arc::new(Mutex::new(None));
        let items = Arc::new(Mutex::new(Vec::new()));
        flux.subscribe_with(Manual {
            subscription: subscription.clone(),
            items: items.clone(),
        });
        (subscription, items)
    }

    fn request(handle: &Handle<impl Item>, n: u64) {
        let subscription = handle.0.lock().clone();
        if let Some(s) = subscription {
            s.request(n);
        }
    }

    #[test]
    fn test_single_upstream_subscription() {
        let probe = PublisherProbe::of(Flux::range(0, 3));
        let shared = probe.flux().share();
        let a = manual(&shared);
        let b = manual(&shared);
        request(&a, UNBOUNDED);
        request(&b, UNBOUNDED);
        assert_eq!(*a.1.lock(), vec![0, 1, 2]);
        assert_eq!(*b.1.lock(), vec![0, 1, 2]);
        probe.assert_was_subscribed();
    }

    #[test]
    fn test_late_subscriber_misses_earlier_items() {
        let source = TestPublisher::<i32>::create();
        let shared = source.flux().share();
        let a = manual(&shared);
        request(&a, UNBOUNDED);
        source.next(1);
        let b = manual(&shared);
        request(&b, UNBOUNDED);
        source.next(2).complete();
        assert_eq!(*a.1.lock(), vec![1, 2]);
        assert_eq!(*b.1.lock(), vec![2]);
    }

    #[test]
    fn test_slowest_subscriber_paces_upstream() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let r = requests.clone();
        let shared = Flux::range(0, 10).do_on_request(move |n| r.lock().push(n)).share();
        let a = manual(&shared);
        let b = manual(&shared);
        request(&a, 5);
        request(&b, 2);
        assert_eq!(*a.1.lock(), vec![0, 1]);
        request(&b, 3);
        assert_eq!(*requests.lock(), vec![2, 3]);
        assert_eq!(*a.1.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*b.1.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_last_cancel_disconnects() {
        let probe = PublisherProbe::of(Flux::<i32>::never());
        let shared = probe.flux().share();
        let a = manual(&shared);
        let b = manual(&shared);
        let cancel = |h: &Handle<i32>| {
            let s = h.0.lock().clone();
            if let Some(s) = s {
                s.cancel();
            }
        };
        cancel(&a);
        assert!(!probe.was_cancelled());
        cancel(&b);
        probe.assert_was_cancelled();
    }

    #[test]
    fn test_reconnects_after_completion() {
        let probe = PublisherProbe::of(Flux::range(0, 2));
        let shared = probe.flux().share();
        let first = manual(&shared);
        request(&first, UNBOUNDED);
        let second = manual(&shared);
        request(&second, UNBOUNDED);
        assert_eq!(*first.1.lock(), vec![0, 1]);
        assert_eq!(*second.1.lock(), vec![0, 1]);
    }
}
