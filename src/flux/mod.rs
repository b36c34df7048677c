//! # Composition API.
//!
//! A [`Flux<T>`] is an inert description of a sequence of `0..N` items of
//! type `T`. Nothing happens until it is subscribed; every subscription gets
//! fresh per-subscription state (cold semantics) unless the flux was made hot
//! with [`Flux::share`].
//!
//! ```text
//! Flux::range(1, 5)            source      (Publisher)
//!     .map(|v| v * 2)          operator    (Publisher wrapping Publisher)
//!     .filter(|v| v % 3 != 0)  operator
//!     .subscribe(print)        subscriber  (drives demand)
//! ```
//!
//! Operators are grouped by concern:
//! - `source`, `create`: constructors
//! - `transform`, `aggregate`: item-level operators
//! - `flat_map`, `switch_map`, `zip`: combining operators
//! - `error_ops`: error-handling pipeline
//! - `time`, `schedule`: timers and scheduler shifts
//! - `context_ops`: context writes and reads
//! - `share`: hot multicast
//! - `block`, `subscribe`: terminal entry points

use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::protocol::{BoxSubscriber, StrictSubscriber, Subscriber};

mod aggregate;
mod block;
mod context_ops;
mod create;
mod error_ops;
mod flat_map;
mod log;
mod peek;
mod scalar;
mod schedule;
mod share;
mod source;
mod subscribe;
mod switch_map;
mod time;
mod transform;
mod zip;

pub use create::FluxSink;
pub use block::FluxStream;
pub use subscribe::Disposable;

/// Types that can travel through a pipeline.
pub trait Item: Send + 'static {}

impl<T: Send + 'static> Item for T {}

/// Producer of a sequence; one call to `subscribe` is one subscription.
///
/// Implementations must call `on_subscribe` exactly once before any other
/// signal and never emit more items than were requested.
pub trait Publisher<T>: Send + Sync + 'static {
    /// Starts a subscription for `subscriber` with context `cx`.
    fn subscribe(&self, subscriber: BoxSubscriber<T>, cx: Context);
}

/// Cheaply clonable handle to a publisher.
pub struct Flux<T> {
    inner: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Flux<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flux")
            .field("item", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: Item> Flux<T> {
    /// Wraps a custom publisher.
    pub fn from_publisher(publisher: impl Publisher<T>) -> Self {
        Self {
            inner: Arc::new(publisher),
        }
    }

    /// Subscribes a custom subscriber with an empty context.
    ///
    /// The subscriber is guarded against protocol violations of the pipeline:
    /// over-emission and signals after termination.
    pub fn subscribe_with(&self, subscriber: impl Subscriber<T>) {
        self.subscribe_with_context(subscriber, Context::empty());
    }

    /// Subscribes a custom subscriber with an initial context.
    pub fn subscribe_with_context(&self, subscriber: impl Subscriber<T>, cx: Context) {
        let strict = StrictSubscriber::new(Box::new(subscriber), cx.clone());
        self.inner.subscribe(Box::new(strict), cx);
    }

    /// Subscribes without the protocol guard; used between operators.
    pub(crate) fn subscribe_inner(&self, subscriber: BoxSubscriber<T>, cx: Context) {
        self.inner.subscribe(subscriber, cx);
    }
}

/// Publisher built from a closure; used by operators whose subscribe step
/// is only wiring.
struct FnPublisher<F>(F);

impl<T, F> Publisher<T> for FnPublisher<F>
where
    T: Item,
    F: Fn(BoxSubscriber<T>, Context) + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>, cx: Context) {
        (self.0)(subscriber, cx);
    }
}

impl<T: Item> Flux<T> {
    pub(crate) fn from_fn(f: impl Fn(BoxSubscriber<T>, Context) + Send + Sync + 'static) -> Self {
        Self::from_publisher(FnPublisher(f))
    }
}
