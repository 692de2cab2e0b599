#![no_main]

use libfuzzer_sys::fuzz_target;
use scopegraph::descriptor::{derive, provide};
use scopegraph::scope::Scope;

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }

    let pattern = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let seed = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    match pattern % 5 {
        0 => {
            // Plain resolve, repeated: must stay cached (same Arc) until updated.
            let base = provide(move |_ctl| seed);
            let scope = Scope::builder().build();
            let _ = std::panic::catch_unwind(|| {
                let first = scope.resolve(&base).unwrap();
                let second = scope.resolve(&base).unwrap();
                assert!(std::sync::Arc::ptr_eq(&first, &second));
            });
        }
        1 => {
            // Reactive chain: updating the root must re-run the dependent.
            let base = provide(move |_ctl| seed);
            let doubled = derive(base.reactive(), |n, _ctl| n.wrapping_mul(2));
            let scope = Scope::builder().build();
            let _ = std::panic::catch_unwind(|| {
                let before = *scope.resolve(&doubled).unwrap();
                assert_eq!(before, seed.wrapping_mul(2));
                scope.update(&base, seed.wrapping_add(1)).unwrap();
                let after = *scope.resolve(&doubled).unwrap();
                assert_eq!(after, seed.wrapping_add(1).wrapping_mul(2));
            });
        }
        2 => {
            // A descriptor must never be confused with another of the same type.
            let a = provide(move |_ctl| seed);
            let b = provide(move |_ctl| seed.wrapping_add(1));
            let sum = derive((a.clone(), b.clone()), |(x, y), _ctl| *x + *y);
            let scope = Scope::builder().build();
            let _ = std::panic::catch_unwind(|| {
                let total = *scope.resolve(&sum).unwrap();
                assert_eq!(total, seed.wrapping_add(seed.wrapping_add(1)));
            });
        }
        3 => {
            // Pod overlay must isolate writes from the parent scope.
            let base = provide(move |_ctl| seed);
            let scope = Scope::builder().build();
            let pod = scope.pod().preset(&base, seed.wrapping_add(7)).build();
            let _ = std::panic::catch_unwind(|| {
                assert_eq!(*pod.resolve(&base).unwrap(), seed.wrapping_add(7));
                assert_eq!(*scope.resolve(&base).unwrap(), seed);
            });
        }
        4 => {
            // A rejected resolution must stay rejected until release, not retried.
            let flaky = provide(move |_ctl| {
                if seed % 2 == 0 {
                    panic!("fuzz-triggered failure");
                }
                seed
            });
            let scope = Scope::builder().build();
            let first = scope.resolve(&flaky);
            let second = scope.resolve(&flaky);
            if seed % 2 == 0 {
                assert!(first.is_err());
                assert!(second.is_err());
            } else {
                assert!(first.is_ok());
                assert!(second.is_ok());
            }
        }
        _ => unreachable!(),
    }
});
