//! Circular dependency detection for descriptor resolution.
//!
//! A thread-local stack of descriptor identities; re-entering a descriptor
//! already on the stack panics with a typed payload, which `catch_unwind`
//! converts back into a typed error at the top of the resolution call.

use std::cell::RefCell;
use std::panic;

use crate::error::{CircularPanic, GraphError, GraphResult};
use crate::key::Key;

const MAX_DEPTH: usize = 1024;

thread_local! {
    static RESOLUTION_TLS: RefCell<ResolutionTls> = RefCell::new(ResolutionTls::default());
}

#[derive(Default)]
struct ResolutionTls {
    // Keyed on descriptor identity, not display name: two distinct
    // descriptors that happen to produce the same type (two `i32`
    // providers, say) must never be confused with a real cycle.
    stack: Vec<Key>,
}

pub(crate) struct StackGuard {
    // Stack length to restore to on drop, rather than a blind pop: a
    // panicking sibling guard further down the call chain never got to
    // push, so popping by count (not by depth) would desync the stack
    // across an unwind.
    depth: usize,
}

impl StackGuard {
    pub(crate) fn new(key: Key) -> Self {
        let depth = RESOLUTION_TLS.with(|tls| {
            let mut tls = tls.borrow_mut();

            if tls.stack.iter().any(|&k| k == key) {
                let mut path: Vec<&'static str> = tls.stack.iter().map(|k| k.display_name()).collect();
                path.push(key.display_name());
                panic::panic_any(CircularPanic { path });
            }

            if tls.stack.len() >= MAX_DEPTH {
                panic::panic_any(CircularPanic {
                    path: tls.stack.iter().map(|k| k.display_name()).collect(),
                });
            }

            let depth = tls.stack.len();
            tls.stack.push(key);
            depth
        });

        Self { depth }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        RESOLUTION_TLS.with(|tls| {
            tls.borrow_mut().stack.truncate(self.depth);
        });
    }
}

/// Runs `f` with `key` pushed onto the thread-local resolution stack,
/// converting a detected cycle into `GraphError::DependencyCycle`.
pub(crate) fn with_circular_catch<T, F>(key: Key, f: F) -> GraphResult<T>
where
    F: FnOnce() -> GraphResult<T>,
{
    use std::panic::AssertUnwindSafe;

    let _guard = StackGuard::new(key);

    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            if let Some(circular) = payload.downcast_ref::<CircularPanic>() {
                Err(GraphError::DependencyCycle(circular.path.clone()))
            } else {
                panic::resume_unwind(payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_direct_reentry() {
        let key = Key::from_identity(0x1234, "A");
        let result: GraphResult<()> = with_circular_catch(key, || with_circular_catch(key, || Ok(())));
        assert!(matches!(result, Err(GraphError::DependencyCycle(_))));
    }

    #[test]
    fn allows_non_overlapping_sequential_calls() {
        let key = Key::from_identity(0x1234, "A");
        let a: GraphResult<()> = with_circular_catch(key, || Ok(()));
        let b: GraphResult<()> = with_circular_catch(key, || Ok(()));
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[test]
    fn same_type_different_identity_is_not_a_cycle() {
        let a = Key::from_identity(0x1000, "i32");
        let b = Key::from_identity(0x2000, "i32");
        let result: GraphResult<()> = with_circular_catch(a, || with_circular_catch(b, || Ok(())));
        assert!(result.is_ok());
    }
}
