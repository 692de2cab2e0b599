//! Property-based coverage for core resolution invariants: single factory
//! invocation per resolve, LIFO cleanup ordering, and deterministic reactive
//! propagation under arbitrary chain lengths.
//!
//! Random chain depth/shape fed through `proptest`, checking an invariant
//! that must hold for every generated case.

use proptest::prelude::*;
use scopegraph::descriptor::{derive, provide};
use scopegraph::scope::Scope;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

proptest! {
    /// For any chain of N `derive` links, each non-reactively caching its
    /// predecessor, resolving the tail runs every factory exactly once no
    /// matter how many times the tail is re-resolved.
    #[test]
    fn derive_chain_factories_run_exactly_once(chain_len in 1usize..12, re_resolves in 0usize..5) {
        let counters: Vec<Arc<AtomicUsize>> = (0..chain_len).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        let mut current = {
            let counter = counters[0].clone();
            provide(move |_ctl| {
                counter.fetch_add(1, Ordering::SeqCst);
                0i64
            })
        };
        for counter in counters.iter().skip(1) {
            let counter = counter.clone();
            current = derive(current, move |prev, _ctl| {
                counter.fetch_add(1, Ordering::SeqCst);
                *prev + 1
            });
        }

        let scope = Scope::builder().build();
        let expected = (chain_len as i64) - 1;
        prop_assert_eq!(*scope.resolve(&current).unwrap(), expected);
        for _ in 0..re_resolves {
            prop_assert_eq!(*scope.resolve(&current).unwrap(), expected);
        }

        for counter in &counters {
            prop_assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    /// N cleanup closures registered on one resolved entry always run in
    /// strict reverse registration order, regardless of N.
    #[test]
    fn cleanup_runs_lifo_for_any_registration_count(n in 1usize..20) {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log_for_factory = log.clone();
        let exec = provide(move |ctl| {
            for i in 0..n {
                let log = log_for_factory.clone();
                ctl.cleanup(move || log.lock().unwrap().push(i));
            }
            0i32
        });

        let scope = Scope::builder().build();
        scope.resolve(&exec).unwrap();
        scope.release(&exec, false).unwrap();

        let seen = log.lock().unwrap().clone();
        let expected: Vec<usize> = (0..n).rev().collect();
        prop_assert_eq!(seen, expected);
    }

    /// Updating the root of a reactive chain of arbitrary length
    /// re-resolves every descriptor transitively reachable via reactive
    /// edges exactly once, and the tail observes the fully propagated value.
    #[test]
    fn reactive_update_propagates_through_chain_of_any_length(chain_len in 1usize..8, new_root in -100i64..100) {
        let root = provide(|_ctl| 0i64);
        let mut current = derive(root.clone().reactive(), |n, _ctl| *n + 1);
        for _ in 1..chain_len {
            current = derive(current.reactive(), |n, _ctl| *n + 1);
        }

        let scope = Scope::builder().build();
        scope.resolve(&current).unwrap();
        scope.update(&root, new_root).unwrap();

        let expected = new_root + chain_len as i64;
        prop_assert_eq!(*scope.resolve(&current).unwrap(), expected);
    }
}
