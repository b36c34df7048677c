//! # Example: schedulers
//!
//! Shows where work runs when a pipeline hops between schedulers, and how a
//! flaky source is retried with backoff.
//!
//! Demonstrates how to:
//! - Build dedicated pools from a [`Config`] with [`Schedulers::from_config`].
//! - Move subscription work with [`Flux::subscribe_on`] (first one near the source wins).
//! - Move signal delivery with [`Flux::publish_on`] (applies from that point on).
//! - Retry with [`RetryPolicy::with_backoff`] and [`BackoffPolicy::exponential`].
//!
//! ## Flow
//! ```text
//! range ─► map(tag "source") ─► subscribe_on(elastic) ─► publish_on(parallel) ─► map(tag "sink")
//!           runs on elastic-worker                          runs on parallel-worker
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=rivulet=debug cargo run --example schedulers
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rivulet::{BackoffPolicy, Config, Flux, FluxError, JitterPolicy, RetryPolicy, Scheduler, Schedulers};
use tracing_subscriber::EnvFilter;

fn thread() -> String {
    std::thread::current().name().unwrap_or("main").to_string()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 1. Dedicated pools sized from config.
    let cfg = Config {
        parallelism: 2,
        bounded_elastic_cap: 4,
        ..Config::default()
    };
    cfg.validate()?;
    let (parallel, elastic) = Schedulers::from_config(&cfg)?;

    // 2. Scheduler hops.
    let hops = Flux::range(1, 4)
        .map(|v| format!("{v} produced on {}", thread()))
        .subscribe_on(elastic.clone())
        .publish_on(parallel.clone())
        .map(|line| format!("{line}, delivered on {}", thread()))
        .collect_blocking(Some(Duration::from_secs(5)))?;
    for line in hops {
        println!("{line}");
    }

    // 3. A source failing twice before succeeding.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let flaky = Flux::from_callable(move || {
        let attempt = counter.fetch_add(1, Ordering::AcqRel) + 1;
        println!("attempt {attempt} on {}", thread());
        if attempt < 3 {
            Err(FluxError::msg(format!("boom #{attempt}")))
        } else {
            Ok(attempt)
        }
    });
    let backoff = BackoffPolicy::exponential(Duration::from_millis(50))
        .with_max(Duration::from_millis(400))
        .with_jitter(JitterPolicy::Equal);
    let value = flaky
        .retry_with(RetryPolicy::with_backoff(5, backoff))
        .block_first(Some(Duration::from_secs(5)))?;
    println!("succeeded with {value:?} after {} attempts", attempts.load(Ordering::Acquire));

    parallel.dispose();
    elastic.dispose();
    Ok(())
}
