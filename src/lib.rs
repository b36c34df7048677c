//! # rivulet
//!
//! **Rivulet** is a backpressure-aware reactive-stream engine.
//!
//! A [`Flux<T>`] describes a lazy, possibly asynchronous sequence of `0..N`
//! items followed by at most one terminal signal. Nothing runs until a
//! subscriber attaches; the subscriber then pulls items by requesting demand,
//! and no publisher ever emits more than was requested.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   assembly (inert)                       subscription (per subscriber)
//! ┌──────────────────────────┐          ┌──────────────────────────────────┐
//! │ Flux::range(..)          │          │ Source state ◄──── request(n) ───│
//! │   .map(..)               │ subscribe│   │                              │
//! │   .flat_map(.., 4)       │ ───────► │   ├── on_next ──► Map ──► FlatMap│
//! │   .publish_on(parallel)  │  (cx)    │   │                         │    │
//! │   .subscribe(..)         │          │   └──────── Worker (lane) ◄──┘    │
//! └──────────────────────────┘          └──────────────────────────────────┘
//!                                                 │
//!                                    Scheduler ───┴── ImmediateScheduler
//!                                                 ├── PoolScheduler (single/parallel/bounded elastic)
//!                                                 └── VirtualTimeScheduler (tests)
//! ```
//!
//! ### Signal protocol
//! ```text
//! on_subscribe  (exactly once, first)
//! on_next*      (never more than requested)
//! on_error | on_complete   (at most one, then nothing)
//! ```
//! Every subscriber attached by [`Flux::subscribe_with`] is guarded: a
//! second terminal, an item after termination, or an item without demand is
//! reported to the [`hooks`] instead of reaching user code.
//!
//! ## Features
//! | Area              | Description                                                     | Key types                                       |
//! |-------------------|-----------------------------------------------------------------|-------------------------------------------------|
//! | **Composition**   | Sources, item operators, combinators, time and scheduler shifts | [`Flux`], [`FluxSink`]                          |
//! | **Protocol**      | Demand accounting and signal types                              | [`Subscriber`], [`Subscription`], [`Signal`]    |
//! | **Schedulers**    | Workers with ordered execution, delays and disposal             | [`Scheduler`], [`Schedulers`], [`Worker`]       |
//! | **Context**       | Immutable per-subscription key/value data                       | [`Context`]                                     |
//! | **Errors**        | Typed runtime and assembly errors                               | [`FluxError`], [`AssemblyError`]                |
//! | **Retry**         | Retry budgets with backoff and jitter                           | [`RetryPolicy`], [`BackoffPolicy`]              |
//! | **Testing**       | Step verification, virtual time, manual publishers              | [`testing::StepVerifier`], [`testing::TestPublisher`] |
//! | **Configuration** | Prefetch, concurrency and pool sizing defaults                  | [`Config`]                                      |
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use rivulet::{Flux, Schedulers};
//!
//! let squares = Flux::range(1, 5)
//!     .map(|v| v * v)
//!     .filter(|v| v % 2 == 1)
//!     .publish_on(Schedulers::parallel())
//!     .collect_blocking(Some(Duration::from_secs(5)))
//!     .unwrap();
//! assert_eq!(squares, vec![1, 9, 25]);
//! ```
mod config;
mod context;
mod error;
mod flux;
pub mod hooks;
mod policies;
mod protocol;
mod scheduler;
pub mod testing;

// ---- Public re-exports ----

pub use config::{Config, DEFAULT_PREFETCH};
pub use context::Context;
pub use error::{AssemblyError, BoxError, FluxError};
pub use flux::{Disposable, Flux, FluxSink, FluxStream, Item, Publisher};
pub use policies::{BackoffPolicy, JitterPolicy, RetryDecision, RetryPolicy};
pub use protocol::{
    add_demand, produced, BoxSubscriber, Signal, SignalType, Subscriber, Subscription,
    SubscriptionRef, UNBOUNDED,
};
pub use scheduler::{
    ImmediateScheduler, PoolScheduler, Runnable, Scheduler, SchedulerRef, Schedulers, TaskHandle,
    VirtualTimeScheduler, Worker,
};
