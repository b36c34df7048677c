//! # Callback subscribers.
//!
//! `subscribe` and `subscribe_with_handlers` request an unbounded amount and
//! hand every signal to closures. An error reaching a subscriber without an
//! error callback goes to [`hooks`](crate::hooks) instead of vanishing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Flux, Item};
use crate::error::FluxError;
use crate::hooks;
use crate::protocol::{Signal, Subscriber, SubscriptionRef, UNBOUNDED};

struct DisposableInner {
    subscription: Mutex<Option<SubscriptionRef>>,
    disposed: AtomicBool,
}

/// Handle returned by the callback `subscribe` methods.
#[derive(Clone)]
pub struct Disposable {
    inner: Arc<DisposableInner>,
}

impl Disposable {
    fn new() -> Self {
        Self {
            inner: Arc::new(DisposableInner {
                subscription: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Cancels the subscription; idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscription = self.inner.subscription.lock().take();
        if let Some(s) = subscription {
            s.cancel();
        }
    }

    /// True after [`dispose`](Self::dispose) or once the flux terminated.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

type OnNext<T> = Box<dyn FnMut(T) + Send>;
type OnError = Box<dyn FnMut(FluxError) + Send>;
type OnComplete = Box<dyn FnMut() + Send>;

struct LambdaSubscriber<T> {
    on_next: OnNext<T>,
    on_error: Option<OnError>,
    on_complete: Option<OnComplete>,
    handle: Disposable,
}

impl<T: Item> Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.handle.is_disposed() {
            subscription.cancel();
            return;
        }
        *self.handle.inner.subscription.lock() = Some(Arc::clone(&subscription));
        subscription.request(UNBOUNDED);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(v) => (self.on_next)(v),
            Signal::Error(e) => {
                self.release();
                match self.on_error.as_mut() {
                    Some(f) => f(e),
                    None => hooks::unhandled_error(&e),
                }
            }
            Signal::Complete => {
                self.release();
                if let Some(f) = self.on_complete.as_mut() {
                    f();
                }
            }
        }
    }
}

impl<T> LambdaSubscriber<T> {
    fn release(&self) {
        self.handle.inner.disposed.store(true, Ordering::Release);
        self.handle.inner.subscription.lock().take();
    }
}

impl<T: Item> Flux<T> {
    /// Consumes every item with `on_next`. Errors are reported to the
    /// unhandled-error hook.
    ///
    /// ```
    /// use std::sync::{Arc, Mutex};
    /// use rivulet::Flux;
    ///
    /// let seen = Arc::new(Mutex::new(Vec::new()));
    /// let s = seen.clone();
    /// Flux::range(1, 3).subscribe(move |v| s.lock().unwrap().push(v));
    /// assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    /// ```
    pub fn subscribe(&self, on_next: impl FnMut(T) + Send + 'static) -> Disposable {
        self.subscribe_lambda(Box::new(on_next), None, None)
    }

    /// Consumes every signal with its own callback.
    pub fn subscribe_with_handlers(
        &self,
        on_next: impl FnMut(T) + Send + 'static,
        on_error: impl FnMut(FluxError) + Send + 'static,
        on_complete: impl FnMut() + Send + 'static,
    ) -> Disposable {
        self.subscribe_lambda(Box::new(on_next), Some(Box::new(on_error)), Some(Box::new(on_complete)))
    }

    fn subscribe_lambda(
        &self,
        on_next: OnNext<T>,
        on_error: Option<OnError>,
        on_complete: Option<OnComplete>,
    ) -> Disposable {
        let handle = Disposable::new();
        self.subscribe_with(LambdaSubscriber {
            on_next,
            on_error,
            on_complete,
            handle: handle.clone(),
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPublisher;
    use std::time::Duration;

    #[test]
    fn test_triple_callbacks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let handle = Flux::range(1, 2).subscribe_with_handlers(
            move |v| a.lock().push(format!("next {v}")),
            move |e| b.lock().push(format!("error {e}")),
            move || c.lock().push("complete".to_string()),
        );
        assert_eq!(*log.lock(), vec!["next 1", "next 2", "complete"]);
        assert!(handle.is_disposed());
    }

    #[test]
    fn test_dispose_cancels() {
        let source = TestPublisher::<i32>::create();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let handle = source.flux().subscribe(move |v| s.lock().push(v));
        source.next(1);
        handle.dispose();
        source.assert_was_cancelled();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn test_missing_error_callback_reaches_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        hooks::set_unhandled_error_hook(move |e| s.lock().push(e.to_string()));
        Flux::<i32>::error(FluxError::msg("unhandled-in-subscribe")).subscribe(|_| {});
        hooks::reset_unhandled_error_hook();
        assert!(seen.lock().iter().any(|m| m == "unhandled-in-subscribe"));
    }

    #[test]
    fn test_asynchronous_source() {
        let (tx, rx) = std::sync::mpsc::channel();
        let done = tx.clone();
        Flux::interval(Duration::from_millis(1)).take(3).subscribe_with_handlers(
            move |v| {
                let _ = tx.send(Some(v));
            },
            |_| {},
            move || {
                let _ = done.send(None);
            },
        );
        let received: Vec<_> = rx.iter().take_while(Option::is_some).flatten().collect();
        assert_eq!(received, vec![0, 1, 2]);
    }
}
