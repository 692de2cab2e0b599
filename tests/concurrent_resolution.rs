//! Concurrency invariants: concurrent `resolve` calls for the same
//! descriptor share one pending slot (the factory runs exactly once), and a
//! `Scope` is safely shared across threads.
//!
//! N threads racing one shared `Scope`, using `std::thread`/
//! `std::sync::Barrier`.

use scopegraph::descriptor::provide;
use scopegraph::scope::Scope;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_resolve_calls_share_one_pending_slot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let slow = provide(move |_ctl| {
        c.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        42i64
    });

    let scope = Scope::builder().build();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let scope = scope.clone();
            let slow = slow.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                *scope.resolve(&slow).unwrap()
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "one factory invocation regardless of racing resolvers");
}

#[test]
fn scope_is_shared_safely_across_threads_for_distinct_descriptors() {
    let scope = Scope::builder().build();
    let threads = 16;

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let scope = scope.clone();
            thread::spawn(move || {
                let exec = provide(move |_ctl| i);
                *scope.resolve(&exec).unwrap()
            })
        })
        .collect();

    let mut results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort_unstable();
    assert_eq!(results, (0..threads).collect::<Vec<_>>());
}

#[test]
fn update_waits_for_reactive_cascade_before_returning() {
    let base = provide(|_ctl| 1i32);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_for_derive = seen.clone();
    let doubled = scopegraph::descriptor::derive(base.clone().reactive(), move |n, _ctl| {
        seen_for_derive.lock().unwrap().push(*n);
        *n * 2
    });

    let scope = Scope::builder().build();
    scope.resolve(&doubled).unwrap();
    scope.update(&base, 21).unwrap();

    // by the time `update` returns, the reactive dependent has already
    // re-run and its new value is visible
    assert_eq!(*scope.resolve(&doubled).unwrap(), 42);
    assert_eq!(seen.lock().unwrap().as_slice(), &[1, 21]);
}
