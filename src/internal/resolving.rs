//! Thread-local stack of descriptors currently invoking their factory.
//!
//! Shared by `scope`/`pod` (to know which descriptor is asking when a
//! reactive dependency edge is resolved, so the reverse edge can be
//! recorded) and `descriptor` (to label a failed dependency resolution with
//! the dependent's name without threading it through every `Dependencies`
//! impl). Distinct from `circular`'s stack of `&'static str` names: this one
//! carries full `Key`s because reverse-edge bookkeeping needs identity, not
//! just a display label.

use std::cell::RefCell;

use crate::key::Key;

thread_local! {
    static STACK: RefCell<Vec<Key>> = RefCell::new(Vec::new());
}

/// Pushes `key` for the lifetime of the guard; pops it on drop, including on
/// unwind, so a panicking factory leaves the stack consistent.
pub(crate) struct ResolvingGuard;

impl ResolvingGuard {
    pub(crate) fn push(key: Key) -> Self {
        STACK.with(|s| s.borrow_mut().push(key));
        ResolvingGuard
    }
}

impl Drop for ResolvingGuard {
    fn drop(&mut self) {
        STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// The descriptor whose factory is currently running on this thread, if any.
pub(crate) fn current() -> Option<Key> {
    STACK.with(|s| s.borrow().last().copied())
}
