//! # Leaving the reactive world.
//!
//! Blocking adapters park the calling thread until the flux terminates or
//! the timeout elapses; `None` falls back to `Config::block_timeout`. They
//! refuse to run on threads of the single and parallel schedulers, where
//! parking would stall every pipeline sharing the lane.
//!
//! [`Flux::into_stream`] bridges to `futures::Stream` without blocking,
//! requesting one item per poll.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;

use super::{Flux, Item};
use crate::config::Config;
use crate::error::FluxError;
use crate::protocol::{Signal, Subscriber, SubscriptionRef, UNBOUNDED};
use crate::scheduler::is_non_blocking_thread;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Keep {
    First,
    Last,
    All,
}

struct Collected<T> {
    items: Vec<T>,
    outcome: Option<Result<(), FluxError>>,
    subscription: Option<SubscriptionRef>,
}

struct Blocking<T> {
    slot: Mutex<Collected<T>>,
    ready: Condvar,
}

struct BlockingSubscriber<T> {
    shared: Arc<Blocking<T>>,
    keep: Keep,
}

impl<T: Item> Subscriber<T> for BlockingSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.shared.slot.lock().subscription = Some(Arc::clone(&subscription));
        subscription.request(if self.keep == Keep::First { 1 } else { UNBOUNDED });
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let mut slot = self.shared.slot.lock();
        if slot.outcome.is_some() {
            return;
        }
        let cancel = match signal {
            Signal::Next(v) => {
                if self.keep == Keep::Last {
                    slot.items.clear();
                }
                slot.items.push(v);
                if self.keep != Keep::First {
                    return;
                }
                slot.outcome = Some(Ok(()));
                slot.subscription.take()
            }
            Signal::Error(e) => {
                slot.outcome = Some(Err(e));
                slot.subscription.take();
                None
            }
            Signal::Complete => {
                slot.outcome = Some(Ok(()));
                slot.subscription.take();
                None
            }
        };
        drop(slot);
        self.shared.ready.notify_all();
        if let Some(s) = cancel {
            s.cancel();
        }
    }
}

impl<T: Item> Flux<T> {
    fn block_on(&self, timeout: Option<Duration>, keep: Keep) -> Result<Vec<T>, FluxError> {
        if is_non_blocking_thread() {
            let thread = std::thread::current().name().unwrap_or("unnamed").to_string();
            return Err(FluxError::Blocking { thread });
        }
        let shared = Arc::new(Blocking {
            slot: Mutex::new(Collected {
                items: Vec::new(),
                outcome: None,
                subscription: None,
            }),
            ready: Condvar::new(),
        });
        self.subscribe_with(BlockingSubscriber {
            shared: Arc::clone(&shared),
            keep,
        });

        let timeout = timeout.or_else(|| Config::default().block_timeout_opt());
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = shared.slot.lock();
        while slot.outcome.is_none() {
            let Some(deadline) = deadline else {
                shared.ready.wait(&mut slot);
                continue;
            };
            if shared.ready.wait_until(&mut slot, deadline).timed_out() && slot.outcome.is_none() {
                let subscription = slot.subscription.take();
                drop(slot);
                if let Some(s) = subscription {
                    s.cancel();
                }
                let timeout = timeout.unwrap_or_default();
                tracing::debug!(?timeout, "blocking adapter timed out; subscription cancelled");
                return Err(FluxError::Timeout { timeout });
            }
        }
        let outcome = slot.outcome.take().unwrap_or(Ok(()));
        let items = std::mem::take(&mut slot.items);
        outcome.map(|()| items)
    }

    /// Blocks until the first item or completion; the subscription is
    /// cancelled after the first item.
    pub fn block_first(&self, timeout: Option<Duration>) -> Result<Option<T>, FluxError> {
        Ok(self.block_on(timeout, Keep::First)?.into_iter().next())
    }

    /// Blocks until completion and returns the last item.
    pub fn block_last(&self, timeout: Option<Duration>) -> Result<Option<T>, FluxError> {
        Ok(self.block_on(timeout, Keep::Last)?.pop())
    }

    /// Blocks until completion and returns every item in order.
    pub fn collect_blocking(&self, timeout: Option<Duration>) -> Result<Vec<T>, FluxError> {
        self.block_on(timeout, Keep::All)
    }

    /// Bridges to a `futures::Stream`; dropping the stream cancels.
    pub fn into_stream(self) -> FluxStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(Mutex::new(None));
        self.subscribe_with(StreamSubscriber {
            tx: Some(tx),
            subscription: Arc::clone(&subscription),
        });
        FluxStream {
            rx,
            subscription,
            awaiting: false,
        }
    }
}

struct StreamSubscriber<T> {
    tx: Option<mpsc::UnboundedSender<Result<T, FluxError>>>,
    subscription: Arc<Mutex<Option<SubscriptionRef>>>,
}

impl<T: Item> Subscriber<T> for StreamSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        *self.subscription.lock() = Some(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        let Some(tx) = &self.tx else {
            return;
        };
        match signal {
            Signal::Next(v) => {
                let _ = tx.send(Ok(v));
            }
            Signal::Error(e) => {
                let _ = tx.send(Err(e));
                self.tx = None;
            }
            Signal::Complete => self.tx = None,
        }
    }
}

/// `futures::Stream` view of a [`Flux`], created by [`Flux::into_stream`].
///
/// Yields `Ok(item)` for items, one `Err` for an error, then ends.
pub struct FluxStream<T> {
    rx: mpsc::UnboundedReceiver<Result<T, FluxError>>,
    subscription: Arc<Mutex<Option<SubscriptionRef>>>,
    awaiting: bool,
}

impl<T> Unpin for FluxStream<T> {}

impl<T: Item> Stream for FluxStream<T> {
    type Item = Result<T, FluxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.awaiting {
            this.awaiting = true;
            let subscription = this.subscription.lock().clone();
            if let Some(s) = subscription {
                s.request(1);
            }
        }
        let polled = this.rx.poll_recv(cx);
        if let Poll::Ready(Some(Ok(_))) = &polled {
            this.awaiting = false;
        }
        polled
    }
}

impl<T> Drop for FluxStream<T> {
    fn drop(&mut self) {
        let subscription = self.subscription.lock().take();
        if let Some(s) = subscription {
            s.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Schedulers;
    use crate::testing::PublisherProbe;
    use futures::StreamExt;

    #[test]
    fn test_block_first_cancels_after_one() {
        let probe = PublisherProbe::of(Flux::range(10, 100));
        assert_eq!(probe.flux().block_first(None).unwrap(), Some(10));
        probe.assert_was_cancelled();
    }

    #[test]
    fn test_block_last_and_collect() {
        assert_eq!(Flux::range(0, 4).block_last(None).unwrap(), Some(3));
        assert_eq!(Flux::<i64>::empty().block_last(None).unwrap(), None);
        assert_eq!(Flux::range(0, 3).collect_blocking(None).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_error_is_returned() {
        let err = Flux::<i32>::error(FluxError::msg("bad")).collect_blocking(None).unwrap_err();
        assert_eq!(err.to_string(), "bad");
    }

    #[test]
    fn test_timeout_cancels() {
        let probe = PublisherProbe::of(Flux::<i32>::never());
        let err = probe.flux().block_first(Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
        probe.assert_was_cancelled();
    }

    #[test]
    fn test_values_from_another_scheduler() {
        let flux = Flux::range(0, 5).subscribe_on(Schedulers::parallel());
        assert_eq!(flux.collect_blocking(Some(Duration::from_secs(5))).unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_refuses_non_blocking_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        Schedulers::parallel()
            .schedule(Box::new(move || {
                let _ = tx.send(Flux::just(1).block_first(None));
            }))
            .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap_err().as_label(), "flux_blocking");
    }

    #[tokio::test]
    async fn test_stream_bridge() {
        let items: Vec<_> = Flux::range(0, 3).into_stream().collect().await;
        assert_eq!(items.into_iter().map(Result::unwrap).collect::<Vec<_>>(), vec![0, 1, 2]);

        let mut failing = Flux::<i32>::error(FluxError::msg("late")).into_stream();
        assert!(failing.next().await.unwrap().is_err());
        assert!(failing.next().await.is_none());
    }
}
