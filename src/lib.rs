//! A graph-based dependency-resolution runtime: registration-free, lazily
//! resolved, identity-keyed descriptors with reactive update propagation,
//! layered scoped overlays ([`pod`]), a structured flow runtime for typed
//! success/error execution contexts ([`flow`]), and a composable
//! wrap/init/dispose extension pipeline ([`extension`]).
//!
//! # Overview
//!
//! Four pieces compose the runtime:
//!
//! - [`scope`]: the owning host. `resolve`, `update`, `release`, `dispose`,
//!   cleanup ordering, and `reactive`/`lazy`/`static` edge semantics.
//! - [`pod`]: a copy-on-write overlay over a `Scope` for request- or
//!   test-scoped overrides.
//! - [`flow`]: typed `ok`/`ko` execution contexts, sub-flows, bounded
//!   parallel execution, and an invocation-scoped replay journal.
//! - [`extension`]: hooks into resolution, update, flow execution, and
//!   lifecycle, composing like middleware (last registered, outermost).
//!
//! A descriptor is built with [`descriptor::provide`] (no dependencies) or
//! [`descriptor::derive`] (depends on other descriptors), then resolved
//! through a [`scope::Scope`]:
//!
//! ```rust
//! use scopegraph::descriptor::{provide, derive};
//! use scopegraph::scope::Scope;
//!
//! let count = provide(|_ctl| 1i32);
//! let doubled = derive(count.reactive(), |n, _ctl| *n * 2);
//!
//! let scope = Scope::builder().build();
//! assert_eq!(*scope.resolve(&doubled).unwrap(), 2);
//!
//! scope.update(&count, 10).unwrap();
//! assert_eq!(*scope.resolve(&doubled).unwrap(), 20);
//! ```

pub mod datastore;
pub mod descriptor;
pub mod error;
pub mod extension;
pub mod flow;
pub mod key;
pub mod pod;
pub mod schema;
pub mod scope;
pub mod tag;
pub mod variant;

mod internal;

pub use descriptor::{derive, derive_tagged, provide, provide_tagged, AnyExecutor, Controller, DepSpec, Dependencies, Executor};
pub use error::{GraphError, GraphResult};
pub use extension::Extension;
pub use flow::{define, define_tagged, execute, ExecuteOptions, FlowContext, FlowDefinition, FlowResult, FlowSpec, Handler};
pub use key::Key;
pub use pod::{Pod, PodBuilder};
pub use schema::{custom, SchemaAdapter, SchemaIssue, Value};
pub use scope::{Accessor, Initial, Ready, ResolutionState, Scope, ScopeBuilder};
pub use tag::{tag, Tag, TagOptions};
pub use variant::Variant;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn resolve_then_update_propagates_to_reactive_dependents() {
        let base = provide(|_ctl| 1i32);
        let doubled = derive(base.reactive(), |n, _ctl| *n * 2);

        let scope = Scope::builder().debug_name("demo").build();
        assert_eq!(*scope.resolve(&doubled).unwrap(), 2);
        scope.update(&base, 21).unwrap();
        assert_eq!(*scope.resolve(&doubled).unwrap(), 42);
    }

    #[test]
    fn pod_overlay_overrides_without_touching_parent() {
        let greeting = provide(|_ctl| "hello".to_string());
        let scope = Scope::builder().build();
        let pod = scope.pod().preset(&greeting, "overridden".to_string()).build();

        assert_eq!(*pod.resolve(&greeting).unwrap(), "overridden");
        assert_eq!(*scope.resolve(&greeting).unwrap(), "hello");
    }

    #[test]
    fn factory_panic_surfaces_as_graph_error_not_a_crash() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let flaky: Executor<i32> = provide(move |_ctl| {
            r.fetch_add(1, Ordering::SeqCst);
            panic!("nope")
        });

        let scope = Scope::builder().build();
        let first = scope.resolve(&flaky);
        let second = scope.resolve(&flaky);
        assert!(matches!(first, Err(GraphError::FactoryExecution { .. })));
        assert!(matches!(second, Err(GraphError::FactoryExecution { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 1, "a rejected entry is not retried");
    }
}
