//! # Consumer side of the protocol.

use super::{Signal, SubscriptionRef};

/// Receives a subscription handle, then items, then at most one terminal signal.
///
/// Implementations are driven by exactly one thread at a time; operators that
/// merge several sources serialize delivery before calling in.
///
/// ```
/// use rivulet::{Signal, Subscriber, SubscriptionRef};
///
/// struct Sum(i64, Option<SubscriptionRef>);
///
/// impl Subscriber<i64> for Sum {
///     fn on_subscribe(&mut self, s: SubscriptionRef) {
///         s.request(1);
///         self.1 = Some(s);
///     }
///     fn on_signal(&mut self, signal: Signal<i64>) {
///         if let Signal::Next(v) = signal {
///             self.0 += v;
///             if let Some(s) = &self.1 {
///                 s.request(1);
///             }
///         }
///     }
/// }
/// ```
pub trait Subscriber<T>: Send + 'static {
    /// Called exactly once, before any other signal.
    fn on_subscribe(&mut self, subscription: SubscriptionRef);

    /// Called for each item and for the terminal signal.
    fn on_signal(&mut self, signal: Signal<T>);
}

/// Owned, type-erased subscriber.
pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

impl<T, S> Subscriber<T> for Box<S>
where
    S: Subscriber<T> + ?Sized,
{
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        (**self).on_subscribe(subscription);
    }

    fn on_signal(&mut self, signal: Signal<T>) {
        (**self).on_signal(signal);
    }
}
