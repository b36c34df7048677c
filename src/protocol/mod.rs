//! # Signal and subscription protocol.
//!
//! The wire contract between a producer and a consumer:
//!
//! ```text
//! Publisher::subscribe(subscriber, cx)
//!        │
//!        ▼
//! subscriber.on_subscribe(subscription) ──► subscription.request(n)
//!        │                                         │
//!        ▼                                         ▼
//! on_signal(Next) × ≤ Σn  ───────────────►  on_signal(Error | Complete) × ≤ 1
//! ```
//!
//! - [`Signal`] / [`SignalType`]: closed variants consumed by exhaustive matching.
//! - [`Subscriber`]: the consumer trait.
//! - [`Subscription`]: demand and cancellation, see [`UNBOUNDED`].

mod drain;
mod signal;
mod strict;
mod subscriber;
mod subscription;

pub(crate) use drain::WorkInProgress;
pub(crate) use strict::StrictSubscriber;
pub(crate) use subscription::{EmptySubscription, SubscriptionArbiter};

pub use signal::{Signal, SignalType};
pub use subscriber::{BoxSubscriber, Subscriber};
pub use subscription::{add_demand, produced, Subscription, SubscriptionRef, UNBOUNDED};
