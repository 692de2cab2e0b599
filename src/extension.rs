//! Composable extension pipeline: init/dispose lifecycle hooks plus a
//! wrap-around-resolve decorator chain.
//!
//! Hook registration and fan-out (`init`/`dispose`/`on_error`) is
//! observer-shaped: fire-and-forget, run in registration order. Wrapping
//! composition (`wrap_resolve`/`wrap_execute`) nests instead: the
//! last-registered extension is outermost, exactly as a `Vec` of decorators
//! applied in declaration order composes. `Extension` is one trait with
//! default no-op methods rather than a literal "record of optional hooks",
//! so an implementation only overrides the hooks it cares about.

use std::any::Any;
use std::sync::Arc;

use crate::error::GraphError;
use crate::key::Key;

/// Type-erased resolved value passed through the wrap-resolve chain.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Continuation handed to `Extension::wrap_resolve`; calling it runs the
/// next extension in the chain (or the underlying resolution if this is
/// the innermost wrapper).
pub type Next<'a> = &'a mut dyn FnMut() -> Result<AnyValue, GraphError>;

/// Which `Scope`/`Pod` operation a `wrap_resolve` call is wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOp {
    /// A factory invocation driven by `resolve`/`accessor().resolve()`.
    Resolve,
    /// A cached value replaced via `update`.
    Update,
}

/// Type-erased flow result passed through the wrap-execute chain. Always
/// present: a flow invocation never escapes without an envelope, so unlike
/// `wrap_resolve` there is no error case to carry alongside it.
pub type AnyOutcome = Arc<dyn Any + Send + Sync>;

/// Continuation handed to `Extension::wrap_execute`.
pub type ExecuteNext<'a> = &'a mut dyn FnMut() -> AnyOutcome;

/// Identifies one flow handler invocation to `wrap_execute`/`on_error`.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionMeta {
    /// The flow definition's declared name.
    pub flow_name: &'static str,
    /// Nesting depth: 0 for a top-level `flow::execute`, N+1 for a sub-flow
    /// or parallel item executed via `FlowContext::execute`/`execute_parallel`.
    pub depth: usize,
}

/// A composable hook into scope lifecycle, resolution, and flow execution.
///
/// All methods default to no-ops, so an extension only needs to override
/// the hooks it cares about.
pub trait Extension: Send + Sync {
    /// Called once when the extension is registered with a scope.
    fn init(&self, _scope_debug_name: &str) {}

    /// Called once when a pod carrying this extension (inherited from its
    /// parent scope, or registered directly on the pod) is created.
    fn init_pod(&self, _pod_debug_name: &str) {}

    /// Wraps one resolution or update. Implementations that only want to
    /// observe should call `next()` exactly once and return its result
    /// unchanged; implementations that want to transform the value may
    /// inspect or replace what `next()` returns.
    fn wrap_resolve(&self, _op: ResolveOp, _key: Key, next: Next<'_>) -> Result<AnyValue, GraphError> {
        next()
    }

    /// Wraps one flow handler invocation (top-level, sub-flow, or parallel
    /// item). `next()` always produces a `FlowResult<Ok, Ko>` erased behind
    /// `AnyOutcome`; the flow runtime downcasts it back.
    fn wrap_execute(&self, _meta: &ExecutionMeta, next: ExecuteNext<'_>) -> AnyOutcome {
        next()
    }

    /// Fired when a resolution this extension wrapped ultimately fails.
    /// Fire-and-forget: a panic here is caught and swallowed with a
    /// warning rather than corrupting scope state.
    fn on_error(&self, _key: Key, _error: &GraphError) {}

    /// Called once when the owning scope is disposed.
    fn dispose(&self) {}

    /// Called once when a pod carrying this extension is disposed.
    fn dispose_pod(&self) {}
}

/// Ordered extension chain. `Scope`/`Pod` own one of these.
#[derive(Default, Clone)]
pub(crate) struct ExtensionChain {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionChain {
    pub(crate) fn push(&mut self, extension: Arc<dyn Extension>) {
        self.extensions.push(extension);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.extensions.iter()
    }

    pub(crate) fn init_all(&self, scope_debug_name: &str) {
        for ext in &self.extensions {
            ext.init(scope_debug_name);
        }
    }

    pub(crate) fn init_pod_all(&self, pod_debug_name: &str) {
        for ext in &self.extensions {
            ext.init_pod(pod_debug_name);
        }
    }

    pub(crate) fn dispose_all(&self) {
        for ext in self.extensions.iter().rev() {
            let ext = ext.clone();
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                ext.dispose();
            })) {
                drop(payload);
                eprintln!("[scopegraph] extension dispose hook panicked; ignoring");
            }
        }
    }

    pub(crate) fn dispose_pod_all(&self) {
        for ext in self.extensions.iter().rev() {
            let ext = ext.clone();
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                ext.dispose_pod();
            })) {
                drop(payload);
                eprintln!("[scopegraph] extension dispose_pod hook panicked; ignoring");
            }
        }
    }

    pub(crate) fn notify_error(&self, key: Key, error: &GraphError) {
        for ext in &self.extensions {
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                ext.on_error(key, error);
            })) {
                drop(payload);
                eprintln!("[scopegraph] extension on_error hook panicked; ignoring");
            }
        }
    }

    /// Runs `resolve` through every registered extension, with the last
    /// registered extension outermost (it sees the call first and the
    /// result last).
    pub(crate) fn wrap<F>(&self, op: ResolveOp, key: Key, resolve: F) -> Result<AnyValue, GraphError>
    where
        F: FnOnce() -> Result<AnyValue, GraphError>,
    {
        // Build from the innermost (the real resolution) outward, so
        // folding in registration order nests later registrations outside
        // earlier ones.
        let mut chain: Box<dyn FnMut() -> Result<AnyValue, GraphError>> = {
            let mut resolve = Some(resolve);
            Box::new(move || {
                let f = resolve.take().expect("resolve thunk invoked more than once");
                f()
            })
        };

        for ext in &self.extensions {
            let ext = ext.clone();
            let mut inner = chain;
            chain = Box::new(move || ext.wrap_resolve(op, key, &mut inner));
        }

        chain()
    }

    /// Runs one flow handler invocation through every registered extension,
    /// same nesting rule as [`ExtensionChain::wrap`].
    pub(crate) fn wrap_execute<F>(&self, meta: &ExecutionMeta, run: F) -> AnyOutcome
    where
        F: FnOnce() -> AnyOutcome,
    {
        let mut chain: Box<dyn FnMut() -> AnyOutcome> = {
            let mut run = Some(run);
            Box::new(move || run.take().expect("execute thunk invoked more than once")())
        };

        for ext in &self.extensions {
            let ext = ext.clone();
            let mut inner = chain;
            chain = Box::new(move || ext.wrap_execute(meta, &mut inner));
        }

        chain()
    }
}

/// Built-in extension logging resolve timings to stderr.
///
/// Gated behind the `diagnostics` feature, the same way the crate gates
/// other verbose diagnostics.
#[cfg(feature = "diagnostics")]
pub struct LoggingExtension {
    label: &'static str,
}

#[cfg(feature = "diagnostics")]
impl LoggingExtension {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

#[cfg(feature = "diagnostics")]
impl Extension for LoggingExtension {
    fn init(&self, scope_debug_name: &str) {
        eprintln!("[{}] scope initialized: {scope_debug_name}", self.label);
    }

    fn wrap_resolve(&self, _op: ResolveOp, key: Key, next: Next<'_>) -> Result<AnyValue, GraphError> {
        let start = std::time::Instant::now();
        let result = next();
        let elapsed = start.elapsed();
        match &result {
            Ok(_) => eprintln!(
                "[{}] resolved {} in {:?}",
                self.label,
                key.display_name(),
                elapsed
            ),
            Err(e) => eprintln!(
                "[{}] failed to resolve {} in {:?}: {e}",
                self.label,
                key.display_name(),
                elapsed
            ),
        }
        result
    }

    fn on_error(&self, key: Key, error: &GraphError) {
        eprintln!(
            "[{}] error on {}: {error}",
            self.label,
            key.display_name()
        );
    }
}
