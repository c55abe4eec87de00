//! Integration tests for core-async.
//!
//! These tests verify the worker runtime and primitives the task engine builds on.

use core_async::runtime::worker_runtime;
use core_async::sync::blocking::{lock, Condvar, Mutex};
use core_async::sync::oneshot;
use core_async::time::{self, Deadline, Duration, Instant};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_blocking_pool_is_bounded() {
    let runtime = worker_runtime("bounded", 2).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            runtime.spawn_blocking(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for handle in handles {
        runtime.block_on(handle).unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_condvar_wait_with_deadline() {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let signaller = Arc::clone(&pair);

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        *lock(&signaller.0) = true;
        signaller.1.notify_all();
    });

    let deadline = Deadline::after(Duration::from_secs(2));
    let mut ready = lock(&pair.0);
    while !*ready {
        let remaining = deadline.remaining().expect("signal should arrive in time");
        ready = pair.1.wait_timeout(ready, remaining).unwrap().0;
    }
    assert!(*ready);
}

#[tokio::test]
async fn test_oneshot_from_blocking_thread() {
    let (tx, rx) = oneshot::channel();

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        tx.send(42).unwrap();
    });

    assert_eq!(rx.await.unwrap(), 42);
}

#[tokio::test]
async fn test_timeout_failure() {
    let result = time::timeout(Duration::from_millis(10), async {
        time::sleep(Duration::from_millis(100)).await;
        42
    })
    .await;

    assert!(result.is_err());
}

#[test]
fn test_elapsed_millis_tracks_sleep() {
    let start = Instant::now();
    std::thread::sleep(Duration::from_millis(25));
    let elapsed = time::elapsed_millis(start);
    assert!(elapsed >= 25);
    assert!(elapsed < 1_000);
}
