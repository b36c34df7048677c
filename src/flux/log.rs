//! # Signal logging.
//!
//! Records every signal crossing this point as a `tracing::info!` event.
//! Install a subscriber (e.g. `tracing-subscriber` with an env filter) to see them.

use std::fmt::Debug;
use std::sync::Arc;

use super::peek::Peek;
use super::{Flux, Item};
use crate::error::FluxError;
use crate::protocol::{SignalType, UNBOUNDED};

impl<T: Item + Debug> Flux<T> {
    /// Logs `on_subscribe`, `request(n)`, `on_next`, `on_error`,
    /// `on_complete` and `cancel` under `category`.
    pub fn log(self, category: &str) -> Flux<T> {
        let category: Arc<str> = Arc::from(category);
        let (c1, c2, c3, c4, c5, c6) = (
            category.clone(),
            category.clone(),
            category.clone(),
            category.clone(),
            category.clone(),
            category,
        );
        self.peek(Peek {
            on_subscribe: Some(Arc::new(move || {
                tracing::info!(category = %c1, signal = SignalType::OnSubscribe.as_label());
            })),
            on_request: Some(Arc::new(move |n: u64| {
                let amount = if n == UNBOUNDED { "unbounded".to_string() } else { n.to_string() };
                tracing::info!(category = %c2, signal = SignalType::Request.as_label(), %amount);
            })),
            on_next: Some(Arc::new(move |v: &T| {
                tracing::info!(category = %c3, signal = SignalType::OnNext.as_label(), item = ?v);
            })),
            on_error: Some(Arc::new(move |e: &FluxError| {
                tracing::info!(category = %c4, signal = SignalType::OnError.as_label(), error = %e);
            })),
            on_complete: Some(Arc::new(move || {
                tracing::info!(category = %c5, signal = SignalType::OnComplete.as_label());
            })),
            on_cancel: Some(Arc::new(move || {
                tracing::info!(category = %c6, signal = SignalType::Cancel.as_label());
            })),
            on_finally: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StepVerifier;

    #[test]
    fn test_log_is_transparent() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let flux = Flux::range(1, 3).log("numbers").map(|v| v + 1).log("incremented");
        StepVerifier::create(flux)
            .expect_next_sequence([2, 3, 4])
            .verify_complete()
            .unwrap();
    }
}
