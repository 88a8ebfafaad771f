use crate::framework::*;
use netfetch_test_utils::{enable_tracing, iter_check};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn key(k: &str) -> OperationKey {
    OperationKey::from_parts([k])
}

fn config(base_delay_ms: u32, max_delay_ms: u32) -> BackoffConfig {
    BackoffConfig {
        base_delay_ms,
        max_delay_ms,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delays_grow_per_key_and_cap() {
    let backoff = BackoffScheduler::new("test", config(10_000, 40_000));

    let delays = (0..4)
        .map(|_| backoff.schedule(key("a"), "a", || ()))
        .collect::<Vec<_>>();
    assert_eq!(
        vec![
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(40),
            Duration::from_secs(40),
        ],
        delays
    );
    assert_eq!(4, backoff.failed_count(&key("a")));

    // other keys are independent
    assert_eq!(
        Duration::from_secs(10),
        backoff.schedule(key("b"), "b", || ())
    );

    backoff.clear_failed_count(&key("a"));
    assert_eq!(0, backoff.failed_count(&key("a")));
    assert_eq!(
        Duration::from_secs(10),
        backoff.schedule(key("a"), "a", || ())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_work_runs_after_delay() {
    enable_tracing();
    let backoff = BackoffScheduler::new("test", config(10, 100));
    let ran = Arc::new(AtomicU32::new(0));

    let r = ran.clone();
    backoff.schedule(key("a"), "a", move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    let r = ran.clone();
    backoff.schedule_with_initial_delay(
        key("b"),
        "b",
        Duration::from_millis(5),
        move || {
            r.fetch_add(1, Ordering::SeqCst);
        },
    );
    assert_eq!(0, backoff.failed_count(&key("b")));

    iter_check!({
        if ran.load(Ordering::SeqCst) == 2 {
            break;
        }
    });
    assert_eq!(0, backoff.scheduled_count());
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_runs_scheduled_work_immediately() {
    let backoff = BackoffScheduler::new("test", config(60_000, 60_000));
    let ran = Arc::new(AtomicU32::new(0));

    for k in ["a", "b", "c"] {
        let r = ran.clone();
        backoff.schedule(key(k), k, move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(3, backoff.scheduled_count());

    backoff.retry_scheduled_runnables();
    assert_eq!(3, ran.load(Ordering::SeqCst));
    assert_eq!(0, backoff.scheduled_count());

    // failure counts survive a retry
    assert_eq!(1, backoff.failed_count(&key("a")));

    backoff.retry_scheduled_runnables();
    assert_eq!(3, ran.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_scheduler_abandons_work() {
    let backoff = BackoffScheduler::new("test", config(20, 20));
    let ran = Arc::new(AtomicU32::new(0));
    let r = ran.clone();
    backoff.schedule(key("a"), "a", move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    drop(backoff);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(0, ran.load(Ordering::SeqCst));
}
