//! Retry policies.
//!
//! This module groups the knobs that control **if/when** an erroring pipeline
//! is resubscribed and **how long** to wait between attempts.
//!
//! ## Contents
//! - [`RetryPolicy`] how many resubscriptions, immediate or delayed
//! - [`BackoffPolicy`] how retry delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`] randomization of each delay
//!
//! ## Quick wiring
//! ```text
//! flux.retry_with(RetryPolicy::with_backoff(3, BackoffPolicy::exponential(100ms)))
//!      └─► on Error: policy.decide(err, attempt)
//!           - Now        → resubscribe (trampolined)
//!           - After(d)   → resubscribe on the context's timer scheduler after d
//!           - GiveUp     → policy.exhausted(err, attempts) downstream
//! ```

mod backoff;
mod jitter;
mod retry;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use retry::{RetryDecision, RetryPolicy};
