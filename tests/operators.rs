//! Crate-level behaviour of the operator algebra.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rivulet::testing::{PublisherProbe, StepVerifier, TestPublisher};
use rivulet::{Flux, FluxError};

const HOUR: Duration = Duration::from_secs(3600);

fn delayed(v: u64) -> Flux<u64> {
    // item 1 waits longer than item 2
    let delay = if v == 1 { Duration::from_secs(2) } else { Duration::from_secs(1) };
    Flux::just(v * 10).delay_elements(delay)
}

#[test]
fn flat_map_interleaves_by_completion() {
    StepVerifier::with_virtual_time(|| Flux::from_iter(vec![1u64, 2]).flat_map(delayed))
        .expect_subscription()
        .then_await(Duration::from_secs(2))
        .expect_next_sequence([20, 10])
        .verify_complete()
        .unwrap();
}

#[test]
fn concat_map_keeps_input_order() {
    StepVerifier::with_virtual_time(|| Flux::from_iter(vec![1u64, 2]).concat_map(delayed))
        .expect_subscription()
        .then_await(Duration::from_secs(3))
        .expect_next_sequence([10, 20])
        .verify_complete()
        .unwrap();
}

#[test]
fn zip_stops_at_shortest_source() {
    StepVerifier::create(Flux::range(1, 3).zip_with(Flux::from_iter(vec!["a", "b"])))
        .expect_next((1, "a"))
        .expect_next((2, "b"))
        .verify_complete()
        .unwrap();
}

#[test]
fn switch_map_cancels_inner_in_flight() {
    let probe = PublisherProbe::of(Flux::<i64>::never());
    let inner = probe.clone();
    let outer = TestPublisher::<u32>::create();
    let driver = outer.clone();

    let flux = outer
        .flux()
        .switch_map(move |v| if v == 1 { inner.flux() } else { Flux::just(7) });
    StepVerifier::create(flux)
        .then(move || {
            driver.next(1);
            driver.next(2);
            driver.complete();
        })
        .expect_next(7)
        .verify_complete()
        .unwrap();

    probe.assert_was_subscribed();
    probe.assert_was_cancelled();
}

#[test]
fn merge_fails_fast_and_cancels_siblings() {
    let probe = PublisherProbe::of(Flux::<i64>::never());
    let flux = Flux::merge(vec![
        probe.flux(),
        Flux::error(FluxError::msg("first failure")),
    ]);
    StepVerifier::create(flux)
        .expect_error_message("first failure")
        .verify()
        .unwrap();
    probe.assert_was_cancelled();
}

#[test]
fn concat_stops_at_first_error() {
    let probe = PublisherProbe::of(Flux::range(10, 2));
    let flux = Flux::concat(vec![
        Flux::range(0, 2),
        Flux::error(FluxError::msg("halt")),
        probe.flux(),
    ]);
    StepVerifier::create(flux)
        .expect_next_sequence([0, 1])
        .expect_error_message("halt")
        .verify()
        .unwrap();
    probe.assert_was_not_subscribed();
}

#[test]
fn context_writes_shadow_by_position() {
    let read = || Flux::deferred_contextual(|cx| Flux::just(cx.get_or("k", 0_i32)));
    let flux = read()
        .context_write("k", 10_i32)
        .zip_with(read())
        .context_write("k", 100_i32);
    StepVerifier::create(flux)
        .expect_next((10, 100))
        .verify_complete()
        .unwrap();
}

#[test]
fn hourly_items_verify_without_waiting() {
    StepVerifier::with_virtual_time(|| Flux::interval_with_delay(Duration::ZERO, HOUR).take(5))
        .expect_subscription()
        .expect_next(0)
        .then_await(HOUR)
        .expect_next(1)
        .then_await(HOUR)
        .expect_next(2)
        .then_await(HOUR)
        .expect_next(3)
        .expect_no_event(Duration::from_secs(1800))
        .then_await(Duration::from_secs(1800))
        .expect_next(4)
        .expect_complete()
        .verify_then_assert_that()
        .unwrap()
        .took_less_than(Duration::from_secs(2))
        .has_not_dropped_elements();
}

#[test]
fn map_fusion_matches_composition() {
    let f = |v: i64| v * 7 + 1;
    let g = |v: i64| v - 3;
    let chained = Flux::range(-20, 41).map(f).map(g).collect_blocking(None).unwrap();
    let fused = Flux::range(-20, 41).map(move |v| g(f(v))).collect_blocking(None).unwrap();
    assert_eq!(chained, fused);
}

#[test]
fn reduce_and_scan() {
    StepVerifier::create(Flux::range(1, 4).reduce(|a, b| a + b))
        .expect_next(10)
        .verify_complete()
        .unwrap();
    StepVerifier::create(Flux::<i64>::empty().reduce(|a, b| a + b))
        .verify_complete()
        .unwrap();
    StepVerifier::create(Flux::range(1, 3).scan(|a, b| a + b))
        .expect_next_sequence([1, 3, 6])
        .verify_complete()
        .unwrap();
}

#[test]
fn error_then_fallback_keeps_emitted_items() {
    let flux = Flux::range(0, 3)
        .concat_with(Flux::error(FluxError::msg("down")))
        .on_error_resume(|_| Flux::just(-1));
    StepVerifier::create(flux)
        .expect_next_sequence([0, 1, 2, -1])
        .verify_complete()
        .unwrap();
}

#[test]
fn hot_share_serves_late_subscribers_live_items() {
    let publisher = TestPublisher::<i32>::create();
    let shared = publisher.flux().share();
    let early = Arc::new(Mutex::new(Vec::new()));
    let late = Arc::new(Mutex::new(Vec::new()));

    let e = early.clone();
    shared.subscribe(move |v| e.lock().push(v));
    publisher.next(1);
    let l = late.clone();
    shared.subscribe(move |v| l.lock().push(v));
    publisher.next(2).complete();

    assert_eq!(*early.lock(), vec![1, 2]);
    assert_eq!(*late.lock(), vec![2]);
    publisher.assert_was_subscribed().assert_no_subscribers();
}

#[test]
fn blocking_adapter_times_out() {
    let err = Flux::<i32>::never()
        .block_last(Some(Duration::from_millis(20)))
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.as_label(), "flux_timeout");
}
