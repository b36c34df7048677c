//! # Example: pipeline
//!
//! A small order-processing pipeline showing the composition API.
//!
//! Demonstrates how to:
//! - Build a flux from a collection and transform it with [`Flux::try_map`].
//! - Drop malformed items with [`Flux::on_error_continue`] instead of failing.
//! - Fan out to simulated lookups with [`Flux::flat_map_with`] and a concurrency limit.
//! - Read a request id written with [`Flux::context_write`].
//! - Consume the result with the triple-callback `subscribe_with_handlers`.
//!
//! ## Flow
//! ```text
//! from_iter(raw lines)
//!     ├─► try_map(parse)             ─► bad lines dropped by on_error_continue
//!     ├─► flat_map_with(lookup, 2)   ─► bounded_elastic lanes, completion order
//!     ├─► reduce(total)
//!     └─► context_write("request_id")
//! ```
//!
//! ## Run
//! ```bash
//! RUST_LOG=rivulet=debug cargo run --example pipeline
//! ```

use std::sync::mpsc;
use std::time::Duration;

use rivulet::{Flux, FluxError, Schedulers};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct Order {
    sku: String,
    quantity: u32,
}

fn parse(line: &&'static str) -> Result<Order, FluxError> {
    let (sku, quantity) = line
        .split_once(':')
        .ok_or_else(|| FluxError::msg(format!("malformed line {line:?}")))?;
    let quantity = quantity
        .trim()
        .parse()
        .map_err(|e| FluxError::domain(e).wrap(format!("bad quantity in {line:?}")))?;
    Ok(Order {
        sku: sku.trim().to_string(),
        quantity,
    })
}

/// Simulated blocking price lookup, shifted to the bounded elastic scheduler.
fn lookup(order: Order) -> Flux<u64> {
    Flux::deferred_contextual(move |cx| {
        let request_id: &'static str = cx.get_or("request_id", "unknown");
        let order = order.clone();
        Flux::from_callable(move || {
            std::thread::sleep(Duration::from_millis(20));
            let unit = order.sku.len() as u64 * 100;
            println!("[{request_id}] priced {} x{}", order.sku, order.quantity);
            Ok::<_, FluxError>(unit * u64::from(order.quantity))
        })
    })
    .subscribe_on(Schedulers::bounded_elastic())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let lines = vec!["apple: 3", "pear:2", "broken", "kiwi: x", "plum: 5"];
    let total = Flux::from_iter(lines)
        .try_map(parse)
        .on_error_continue(|err, _item| {
            println!("skipping: {err}");
            Ok(())
        })
        .flat_map_with(lookup, 2)?
        .reduce(|a, b| a + b)
        .context_write("request_id", "req-42");

    let (tx, rx) = mpsc::channel();
    let done = tx.clone();
    total.subscribe_with_handlers(
        move |sum| {
            let _ = tx.send(Ok(sum));
        },
        move |err| {
            let _ = done.send(Err(err));
        },
        || println!("pipeline complete"),
    );

    match rx.recv_timeout(Duration::from_secs(5))? {
        Ok(sum) => println!("order total: {sum}"),
        Err(err) => println!("pipeline failed: {err} ({})", err.as_label()),
    }
    Ok(())
}
