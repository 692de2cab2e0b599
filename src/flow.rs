//! Structured business-flow execution: typed ok/ko results, sub-flows,
//! bounded parallel execution, a replay journal, and schema-validated
//! input/success/error payloads.
//!
//! A [`Handler`] binds dependencies to a body that resolves them and then
//! runs user code; a panic inside that body is caught and converted into a
//! `Ko` by [`run_catching`]; every invocation, top-level or nested, threads
//! through registered extensions uniformly with descriptor resolution via
//! `extension::ExtensionChain::wrap_execute`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::datastore::{DataStore, TagContainer};
use crate::descriptor::Dependencies;
use crate::error::{panic_message, GraphError};
use crate::extension::{AnyOutcome, Extension, ExtensionChain, ExecutionMeta};
use crate::pod::Pod;
use crate::scope::Scope;
use crate::schema::{SchemaAdapter, Value};
use crate::tag::Tag;

/// The outcome of a flow invocation: exactly one of a typed success payload
/// or a typed failure payload, the latter optionally chained to the
/// [`GraphError`] that caused it.
///
/// Business failures are never `panic!`/`Result::Err` in this runtime: a
/// flow that wants to fail calls [`FlowContext::ko`] and returns the value,
/// same as it would call [`FlowContext::ok`] on success.
#[derive(Debug, Clone)]
pub enum FlowResult<O, K> {
    Ok { data: O },
    Ko { data: K, cause: Option<Arc<GraphError>> },
}

impl<O, K> FlowResult<O, K> {
    pub fn is_ok(&self) -> bool {
        matches!(self, FlowResult::Ok { .. })
    }

    pub fn is_ko(&self) -> bool {
        matches!(self, FlowResult::Ko { .. })
    }

    /// The success payload, if this is an `Ok`.
    pub fn ok(self) -> Option<O> {
        match self {
            FlowResult::Ok { data } => Some(data),
            FlowResult::Ko { .. } => None,
        }
    }

    /// The failure payload, if this is a `Ko`.
    pub fn ko(self) -> Option<K> {
        match self {
            FlowResult::Ko { data, .. } => Some(data),
            FlowResult::Ok { .. } => None,
        }
    }
}

/// The declared name, version, and input/success/error schemas of a flow.
///
/// Built once and passed to [`define`]; everything here is immutable for
/// the lifetime of the resulting [`FlowDefinition`].
pub struct FlowSpec<In, O, K> {
    pub name: &'static str,
    pub version: Option<&'static str>,
    pub input: Arc<dyn SchemaAdapter<In>>,
    pub success: Arc<dyn SchemaAdapter<O>>,
    pub error: Arc<dyn SchemaAdapter<K>>,
}

/// A named, schema-bound flow, not yet wired to a handler body.
pub struct FlowDefinition<In, O, K> {
    spec: Arc<FlowSpec<In, O, K>>,
    tags: Arc<DataStore>,
}

impl<In, O, K> Clone for FlowDefinition<In, O, K> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl<In, O, K> FlowDefinition<In, O, K>
where
    In: Send + Sync + 'static,
    O: Send + Sync + 'static,
    K: From<GraphError> + Send + Sync + 'static,
{
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn version(&self) -> Option<&'static str> {
        self.spec.version
    }

    /// Reads `tag`'s first-set value on this flow's metadata bag.
    pub fn tag_find<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<Arc<T>> {
        self.tags.find(tag)
    }

    /// Binds `deps` and a handler body to this definition, producing a
    /// callable [`Handler`]. `deps` is resolved fresh, in the pod, on every
    /// invocation: descriptors are not memoized across flow calls the way
    /// a scope memoizes them across resolutions.
    pub fn handler<D, F>(&self, deps: D, f: F) -> Handler<In, O, K, D>
    where
        D: Dependencies,
        F: Fn(D::Output, &FlowContext<O, K>, In) -> FlowResult<O, K> + Send + Sync + 'static,
    {
        Handler {
            definition: self.clone(),
            deps,
            func: Arc::new(f),
        }
    }
}

/// Declares a new flow with no descriptor-metadata tags.
pub fn define<In, O, K>(spec: FlowSpec<In, O, K>) -> FlowDefinition<In, O, K> {
    define_tagged(spec, |_tags| {})
}

/// Like [`define`], additionally attaching flow metadata through `tags`, a
/// builder callback run once against a fresh [`DataStore`].
pub fn define_tagged<In, O, K>(
    spec: FlowSpec<In, O, K>,
    tags: impl FnOnce(&mut DataStore),
) -> FlowDefinition<In, O, K> {
    let mut store = DataStore::new();
    tags(&mut store);
    FlowDefinition {
        spec: Arc::new(spec),
        tags: Arc::new(store),
    }
}

/// A flow definition bound to its dependencies and handler body. Built by
/// [`FlowDefinition::handler`]; run with [`execute`] or, for a sub-flow,
/// [`FlowContext::execute`].
pub struct Handler<In, O, K, D: Dependencies> {
    definition: FlowDefinition<In, O, K>,
    deps: D,
    func: Arc<dyn Fn(D::Output, &FlowContext<O, K>, In) -> FlowResult<O, K> + Send + Sync>,
}

impl<In, O, K, D: Dependencies> Handler<In, O, K, D> {
    pub fn definition(&self) -> &FlowDefinition<In, O, K> {
        &self.definition
    }
}

impl<In, O, K, D> Clone for Handler<In, O, K, D>
where
    D: Dependencies + Clone,
{
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            deps: self.deps.clone(),
            func: self.func.clone(),
        }
    }
}

/// Per-invocation-tree state shared by a top-level [`execute`] call and
/// every sub-flow/parallel item it spawns: the pod deps resolve against,
/// the `set`/`get` context store, the replay journal, and the extension
/// chain every handler invocation runs through.
///
/// Kept separate from [`FlowContext`] so a sub-flow with a different
/// `Ok2`/`Ko2` schema pair can share this mutable state with its caller
/// without the two needing the same type parameters.
struct ExecutionState {
    pod: Pod,
    store: Mutex<DataStore>,
    journal: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
    extensions: ExtensionChain,
}

/// Handed to a flow handler body: builds its result via [`FlowContext::ok`]/
/// [`FlowContext::ko`], reads/writes shared execution state via
/// [`FlowContext::set`]/[`FlowContext::get`], runs sub-flows via
/// [`FlowContext::execute`]/[`FlowContext::execute_parallel`], and journals
/// side effects via [`FlowContext::run`].
pub struct FlowContext<O, K> {
    state: Arc<ExecutionState>,
    flow_name: &'static str,
    depth: usize,
    success: Arc<dyn SchemaAdapter<O>>,
    error: Arc<dyn SchemaAdapter<K>>,
}

impl<O, K> FlowContext<O, K>
where
    O: Send + Sync + 'static,
    K: From<GraphError> + Send + Sync + 'static,
{
    /// The flow name this context was built for.
    pub fn flow_name(&self) -> &'static str {
        self.flow_name
    }

    /// Nesting depth: 0 for the top-level call, N+1 for a sub-flow.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The pod dependencies are resolved against for this invocation tree.
    pub fn pod(&self) -> &Pod {
        &self.state.pod
    }

    /// Validates `value` through this flow's success schema and builds an
    /// `Ok` result. A validation failure collapses to a `Ko` carrying the
    /// schema issues wrapped as `K`.
    pub fn ok(&self, value: Value) -> FlowResult<O, K> {
        match self.success.validate(value) {
            Ok(data) => FlowResult::Ok { data },
            Err(issues) => FlowResult::Ko {
                data: K::from(GraphError::Schema { issues, path: None }),
                cause: None,
            },
        }
    }

    /// Validates `value` through this flow's error schema and builds a `Ko`
    /// result, optionally chained to `cause`.
    pub fn ko(&self, value: Value, cause: Option<Arc<GraphError>>) -> FlowResult<O, K> {
        match self.error.validate(value) {
            Ok(data) => FlowResult::Ko { data, cause },
            Err(issues) => FlowResult::Ko {
                data: K::from(GraphError::Schema { issues, path: None }),
                cause,
            },
        }
    }

    /// Appends `value` to the execution context's `tag`-keyed store, shared
    /// across every sub-flow and parallel item in this invocation tree.
    pub fn set<T: Send + Sync + 'static>(&self, tag: &Tag<T>, value: T) {
        self.state.store.lock().unwrap().set(tag, value);
    }

    /// Reads `tag`'s first-set value from the execution context store.
    pub fn get<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> crate::error::GraphResult<Arc<T>> {
        self.state.store.lock().unwrap().get(tag)
    }

    /// Reads `tag`'s first-set value from the execution context store,
    /// returning `None` if it was never set and has no default.
    pub fn find<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<Arc<T>> {
        self.state.store.lock().unwrap().find(tag)
    }

    /// Runs `f` once under `key`, journaling its result. A later `run` call
    /// under the same `key`, within the same top-level `execute` invocation,
    /// replays the journaled value instead of calling `f` again.
    ///
    /// Intended for side effects a sub-flow retry should not repeat: the
    /// journal lives as long as the invocation tree, not past it.
    pub fn run<T, F>(&self, key: &'static str, f: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(recorded) = self.state.journal.lock().unwrap().get(key) {
            if let Some(value) = recorded.downcast_ref::<T>() {
                return value.clone();
            }
        }
        let value = f();
        self.state
            .journal
            .lock()
            .unwrap()
            .insert(key, Box::new(value.clone()));
        value
    }

    /// Runs `handler` as a sub-flow: same pod, same execution context store
    /// and journal, one nesting level deeper.
    pub fn execute<In2, O2, K2, D2>(
        &self,
        handler: &Handler<In2, O2, K2, D2>,
        input: Value,
    ) -> FlowResult<O2, K2>
    where
        In2: Send + Sync + 'static,
        O2: Send + Sync + 'static,
        K2: From<GraphError> + Send + Sync + 'static,
        D2: Dependencies,
    {
        run_handler(handler, input, self.state.clone(), self.depth + 1)
    }

    /// Runs `f` as a sub-flow body without a [`Handler`]: a plain function
    /// wrapped through the same extension chain and panic guard as
    /// [`FlowContext::execute`], one nesting level deeper.
    pub fn execute_fn<O2, K2, F>(&self, name: &'static str, f: F) -> FlowResult<O2, K2>
    where
        O2: Send + Sync + 'static,
        K2: From<GraphError> + Send + Sync + 'static,
        F: FnOnce() -> FlowResult<O2, K2> + Send + 'static,
    {
        self.execute_fn_with(name, f, |message| K2::from(GraphError::UncaughtHandler { message }))
    }

    /// Like [`FlowContext::execute_fn`], mapping a panic payload to a `Ko`
    /// through `err_mapper` instead of the default `UncaughtHandler` shape.
    pub fn execute_fn_with<O2, K2, F, M>(&self, name: &'static str, f: F, err_mapper: M) -> FlowResult<O2, K2>
    where
        O2: Send + Sync + 'static,
        K2: Send + Sync + 'static,
        F: FnOnce() -> FlowResult<O2, K2> + Send + 'static,
        M: FnOnce(String) -> K2,
    {
        let meta = ExecutionMeta { flow_name: name, depth: self.depth + 1 };
        let erased = self
            .state
            .extensions
            .wrap_execute(&meta, move || erase_outcome(run_catching_mapped(f, err_mapper)));
        unerase_outcome(erased)
    }

    /// Runs `items` with bounded concurrency, gathering every result.
    ///
    /// Without the `async` feature, items run sequentially in order; with
    /// it, up to `options.max_concurrency` run at once via a dedicated
    /// multi-threaded runtime spun up for the duration of this call.
    pub fn execute_parallel<O2, K2, F>(
        &self,
        items: Vec<F>,
        options: ParallelOptions<O2, K2>,
    ) -> ParallelOutcome<O2, K2>
    where
        O2: Send + Sync + 'static,
        K2: From<GraphError> + Send + Sync + 'static,
        F: FnOnce() -> FlowResult<O2, K2> + Send + 'static,
    {
        let total = items.len();
        #[cfg(feature = "async")]
        {
            execute_parallel_async(items, options, total)
        }
        #[cfg(not(feature = "async"))]
        {
            execute_parallel_sync(items, options, total)
        }
    }
}

/// How [`FlowContext::execute_parallel`] reacts to an item returning `Ko`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Run every item regardless of earlier failures; gather all results.
    #[default]
    Continue,
    /// Cancel remaining items as soon as one fails; `results` is truncated
    /// to the items that had already completed or were in flight.
    FailFast,
    /// Run every item like `Continue`, then build one aggregated `Ko` over
    /// every result via `ParallelOptions::error_mapper` (or, absent that, a
    /// default mapper naming how many of how many items failed). The
    /// aggregate is returned as `ParallelOutcome::aggregated_ko`; callers
    /// that want it to fail the enclosing flow return it from their handler
    /// body themselves.
    FailAll,
}

/// Options for [`FlowContext::execute_parallel`].
pub struct ParallelOptions<O, K> {
    pub failure_mode: FailureMode,
    /// Upper bound on concurrently running items under the `async` feature.
    /// `0` means "one permit per item" (no bound beyond the item count).
    /// Ignored without the `async` feature.
    pub max_concurrency: usize,
    /// Fired once per item, in completion order (which may differ from
    /// index order), with the item's result and its original index.
    pub on_item_complete: Option<Arc<dyn Fn(&FlowResult<O, K>, usize) + Send + Sync>>,
    /// Builds the aggregated `Ko` for `FailureMode::FailAll` from every
    /// item's result. Ignored by `Continue`/`FailFast`. Defaults to a `Ko`
    /// naming the failure count when left unset.
    pub error_mapper: Option<Arc<dyn Fn(&[FlowResult<O, K>]) -> K + Send + Sync>>,
}

impl<O, K> Default for ParallelOptions<O, K> {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::default(),
            max_concurrency: 0,
            on_item_complete: None,
            error_mapper: None,
        }
    }
}

/// How many of [`FlowContext::execute_parallel`]'s items succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelOutcomeKind {
    AllOk,
    AllKo,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Result of a [`FlowContext::execute_parallel`] call. `results` is aligned
/// with the original `items` by index, except under `FailureMode::FailFast`
/// where it is truncated to the items actually run.
pub struct ParallelOutcome<O, K> {
    pub kind: ParallelOutcomeKind,
    pub results: Vec<FlowResult<O, K>>,
    pub stats: ParallelStats,
    /// Set under `FailureMode::FailAll` when at least one item failed: one
    /// `Ko` built over every result by `ParallelOptions::error_mapper` (or
    /// the default mapper). Always `None` under `Continue`/`FailFast`.
    pub aggregated_ko: Option<K>,
}

fn finalize_parallel<O, K>(
    results: Vec<FlowResult<O, K>>,
    total: usize,
    succeeded: usize,
    failed: usize,
    failure_mode: FailureMode,
    error_mapper: &Option<Arc<dyn Fn(&[FlowResult<O, K>]) -> K + Send + Sync>>,
) -> ParallelOutcome<O, K>
where
    K: From<GraphError>,
{
    let ran = results.len();
    let kind = if ran < total {
        ParallelOutcomeKind::Partial
    } else if failed == 0 {
        ParallelOutcomeKind::AllOk
    } else if succeeded == 0 {
        ParallelOutcomeKind::AllKo
    } else {
        ParallelOutcomeKind::Partial
    };
    let aggregated_ko = if failure_mode == FailureMode::FailAll && failed > 0 {
        Some(match error_mapper {
            Some(mapper) => mapper(&results),
            None => K::from(GraphError::UncaughtHandler {
                message: format!("{failed} of {total} parallel items failed"),
            }),
        })
    } else {
        None
    };
    ParallelOutcome {
        kind,
        results,
        stats: ParallelStats { total, succeeded, failed },
        aggregated_ko,
    }
}

#[cfg(not(feature = "async"))]
fn execute_parallel_sync<O, K, F>(
    items: Vec<F>,
    options: ParallelOptions<O, K>,
    total: usize,
) -> ParallelOutcome<O, K>
where
    O: Send + Sync + 'static,
    K: From<GraphError> + Send + Sync + 'static,
    F: FnOnce() -> FlowResult<O, K> + Send + 'static,
{
    let mut results = Vec::with_capacity(total);
    let mut succeeded = 0;
    let mut failed = 0;
    let fail_fast = matches!(options.failure_mode, FailureMode::FailFast);

    for (index, item) in items.into_iter().enumerate() {
        let result = run_catching(item);
        match &result {
            FlowResult::Ok { .. } => succeeded += 1,
            FlowResult::Ko { .. } => failed += 1,
        }
        if let Some(cb) = &options.on_item_complete {
            cb(&result, index);
        }
        let should_stop = fail_fast && result.is_ko();
        results.push(result);
        if should_stop {
            break;
        }
    }

    let failure_mode = options.failure_mode;
    finalize_parallel(results, total, succeeded, failed, failure_mode, &options.error_mapper)
}

#[cfg(feature = "async")]
fn execute_parallel_async<O, K, F>(
    items: Vec<F>,
    options: ParallelOptions<O, K>,
    total: usize,
) -> ParallelOutcome<O, K>
where
    O: Send + Sync + 'static,
    K: From<GraphError> + Send + Sync + 'static,
    F: FnOnce() -> FlowResult<O, K> + Send + 'static,
{
    use std::sync::atomic::{AtomicBool, Ordering};

    let limit = if options.max_concurrency == 0 {
        total.max(1)
    } else {
        options.max_concurrency
    };
    let fail_fast = matches!(options.failure_mode, FailureMode::FailFast);
    let failure_mode = options.failure_mode;
    let on_item_complete = options.on_item_complete.clone();
    let error_mapper = options.error_mapper.clone();
    let semaphore = Arc::new(tokio::sync::Semaphore::new(limit));
    let cancelled = Arc::new(AtomicBool::new(false));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(limit.min(8))
        .enable_time()
        .build()
        .expect("failed to start parallel execution runtime");

    runtime.block_on(async move {
        let mut set = tokio::task::JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("execute_parallel semaphore closed unexpectedly");
            let cancelled = cancelled.clone();
            set.spawn_blocking(move || {
                let _permit = permit;
                if cancelled.load(Ordering::SeqCst) {
                    return (index, None);
                }
                (index, Some(run_catching(item)))
            });
        }

        let mut slots: Vec<Option<FlowResult<O, K>>> = (0..total).map(|_| None).collect();
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        while let Some(joined) = set.join_next().await {
            let (index, outcome) = joined.expect("parallel item task panicked");
            let Some(result) = outcome else { continue };
            match &result {
                FlowResult::Ok { .. } => succeeded += 1,
                FlowResult::Ko { .. } => {
                    failed += 1;
                    if fail_fast {
                        cancelled.store(true, Ordering::SeqCst);
                    }
                }
            }
            if let Some(cb) = &on_item_complete {
                cb(&result, index);
            }
            slots[index] = Some(result);
        }

        let results: Vec<FlowResult<O, K>> = slots.into_iter().flatten().collect();
        finalize_parallel(results, total, succeeded, failed, failure_mode, &error_mapper)
    })
}

/// Options for [`execute`].
#[derive(Default)]
pub struct ExecuteOptions {
    /// An existing scope to build the invocation's pod over. Ignored if
    /// `pod` is set. A fresh scope is built if neither is set.
    pub scope: Option<Scope>,
    /// An existing pod to resolve the handler's dependencies against,
    /// bypassing pod/scope construction entirely.
    pub pod: Option<Pod>,
    /// Seeds the execution context store, readable via `FlowContext::get`
    /// from the first handler invocation onward.
    pub initial_context: Option<DataStore>,
    /// Extensions layered onto a freshly built pod. Ignored when `pod` is
    /// supplied directly: an existing pod already carries its own chain.
    pub extensions: Vec<Arc<dyn Extension>>,
    /// Disposes the implicitly-created scope once execution finishes. Has
    /// no effect when the caller supplied `scope` or `pod` directly: only
    /// an implicit scope's lifecycle is ours to manage.
    pub auto_dispose_scope: bool,
}

/// Runs `handler` to completion: creates a pod (or reuses the supplied
/// one), validates `input` through the handler's input schema, resolves its
/// dependencies in that pod, then invokes the handler body through the
/// pod's extension chain.
///
/// Always returns a [`FlowResult`]: infrastructure failures (schema
/// validation, dependency resolution, a handler panic) surface as `Ko`
/// rather than propagating as a Rust error, so callers never need a second
/// error-handling path alongside the flow's own.
pub fn execute<In, O, K, D>(
    handler: &Handler<In, O, K, D>,
    input: Value,
    mut options: ExecuteOptions,
) -> FlowResult<O, K>
where
    In: Send + Sync + 'static,
    O: Send + Sync + 'static,
    K: From<GraphError> + Send + Sync + 'static,
    D: Dependencies,
{
    let mut owned_scope: Option<Scope> = None;
    let pod = match options.pod.take() {
        Some(pod) => pod,
        None => {
            let scope = match options.scope.take() {
                Some(scope) => scope,
                None => {
                    let scope = Scope::builder().build();
                    owned_scope = Some(scope.clone());
                    scope
                }
            };
            let mut builder = scope.pod();
            for ext in options.extensions.drain(..) {
                builder = builder.extension(ext);
            }
            builder.build()
        }
    };

    let extensions = pod.extensions();
    let state = Arc::new(ExecutionState {
        pod,
        store: Mutex::new(options.initial_context.take().unwrap_or_default()),
        journal: Mutex::new(HashMap::new()),
        extensions,
    });

    let result = run_handler(handler, input, state, 0);

    if options.auto_dispose_scope {
        if let Some(scope) = owned_scope {
            scope.dispose();
        }
    }

    result
}

fn run_handler<In, O, K, D>(
    handler: &Handler<In, O, K, D>,
    input: Value,
    state: Arc<ExecutionState>,
    depth: usize,
) -> FlowResult<O, K>
where
    In: Send + Sync + 'static,
    O: Send + Sync + 'static,
    K: From<GraphError> + Send + Sync + 'static,
    D: Dependencies,
{
    let validated_input = match handler.definition.spec.input.validate(input) {
        Ok(value) => value,
        Err(issues) => {
            return FlowResult::Ko {
                data: K::from(GraphError::Schema { issues, path: None }),
                cause: None,
            }
        }
    };

    let resolved = match handler.deps.resolve(&state.pod) {
        Ok(resolved) => resolved,
        Err(err) => {
            return FlowResult::Ko {
                data: K::from(err),
                cause: None,
            }
        }
    };

    let ctx = FlowContext {
        state: state.clone(),
        flow_name: handler.definition.spec.name,
        depth,
        success: handler.definition.spec.success.clone(),
        error: handler.definition.spec.error.clone(),
    };

    let meta = ExecutionMeta { flow_name: ctx.flow_name, depth };
    let func = handler.func.clone();
    let erased = state
        .extensions
        .wrap_execute(&meta, move || erase_outcome(run_catching(move || func(resolved, &ctx, validated_input))));
    unerase_outcome(erased)
}

fn run_catching<O, K, F>(f: F) -> FlowResult<O, K>
where
    F: FnOnce() -> FlowResult<O, K>,
    K: From<GraphError>,
{
    run_catching_mapped(f, |message| K::from(GraphError::UncaughtHandler { message }))
}

fn run_catching_mapped<O, K, F, M>(f: F, err_mapper: M) -> FlowResult<O, K>
where
    F: FnOnce() -> FlowResult<O, K>,
    M: FnOnce(String) -> K,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload);
            FlowResult::Ko {
                data: err_mapper(message.clone()),
                cause: Some(Arc::new(GraphError::UncaughtHandler { message })),
            }
        }
    }
}

fn erase_outcome<O: Send + Sync + 'static, K: Send + Sync + 'static>(outcome: FlowResult<O, K>) -> AnyOutcome {
    Arc::new(outcome) as AnyOutcome
}

fn unerase_outcome<O: Send + Sync + 'static, K: Send + Sync + 'static>(erased: AnyOutcome) -> FlowResult<O, K> {
    let typed = erased
        .downcast::<FlowResult<O, K>>()
        .expect("wrap_execute extension changed the outcome's concrete type");
    Arc::try_unwrap(typed).unwrap_or_else(|_| {
        panic!("an extension retained a reference to a flow outcome past wrap_execute")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::provide;
    use crate::schema::{custom, SchemaIssue};

    #[derive(Debug, Clone)]
    struct DemoError(String);

    impl From<GraphError> for DemoError {
        fn from(err: GraphError) -> Self {
            DemoError(err.to_string())
        }
    }

    struct DemoErrorAdapter;

    impl SchemaAdapter<DemoError> for DemoErrorAdapter {
        fn validate(&self, input: Value) -> Result<DemoError, Vec<SchemaIssue>> {
            match input {
                Value::String(s) => Ok(DemoError(s)),
                other => Ok(DemoError(format!("{other:?}"))),
            }
        }
    }

    fn demo_definition() -> FlowDefinition<i64, i64, DemoError> {
        define(FlowSpec {
            name: "double",
            version: Some("1"),
            input: Arc::new(custom::<i64>()),
            success: Arc::new(custom::<i64>()),
            error: Arc::new(DemoErrorAdapter),
        })
    }

    fn doubling_handler() -> Handler<i64, i64, DemoError, crate::descriptor::Executor<i64>> {
        let multiplier = provide(|_ctl| 2i64);
        demo_definition().handler(multiplier, |m, ctx, n| ctx.ok(Value::Number((*m * n) as f64)))
    }

    #[test]
    fn execute_runs_handler_to_success() {
        let handler = doubling_handler();
        let result = execute(&handler, Value::Number(21.0), ExecuteOptions::default());
        assert_eq!(result.ok(), Some(42));
    }

    #[test]
    fn execute_fails_input_schema_as_ko() {
        let handler = doubling_handler();
        let result = execute(&handler, Value::String("nope".into()), ExecuteOptions::default());
        assert!(result.is_ko());
    }

    #[test]
    fn execute_catches_handler_panic_as_ko() {
        let boom = demo_definition().handler(provide(|_ctl| 0i64), |_d, _ctx, _n: i64| {
            panic!("boom");
        });
        let result = execute(&boom, Value::Number(1.0), ExecuteOptions::default());
        assert!(result.is_ko());
    }

    #[test]
    fn sub_flow_shares_pod_and_journal() {
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let inner_counter = counter.clone();
        let inner = demo_definition().handler(provide(|_ctl| 1i64), move |_d, ctx, n: i64| {
            let counted = ctx.run("increment", || {
                inner_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as i64
            });
            ctx.ok(Value::Number((n + counted) as f64))
        });

        let outer = demo_definition().handler(provide(|_ctl| 1i64), move |_d, ctx, n: i64| {
            let first = ctx.execute(&inner, Value::Number(n as f64));
            let second = ctx.execute(&inner, Value::Number(n as f64));
            match (first, second) {
                (FlowResult::Ok { data: a }, FlowResult::Ok { data: b }) => ctx.ok(Value::Number((a + b) as f64)),
                _ => ctx.ko(Value::String("sub-flow failed".into()), None),
            }
        });

        let result = execute(&outer, Value::Number(10.0), ExecuteOptions::default());
        // ctx.run journals its first result, so the second sub-flow call replays
        // it instead of incrementing the counter again.
        assert_eq!(result.ok(), Some(20));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn execute_parallel_reports_partial_on_mixed_results() {
        let handler = doubling_handler();
        let outer = demo_definition().handler(provide(|_ctl| 0i64), move |_d, ctx, _n: i64| {
            let h = handler.clone();
            let items: Vec<Box<dyn FnOnce() -> FlowResult<i64, DemoError> + Send>> = vec![
                Box::new({
                    let h = h.clone();
                    move || execute(&h, Value::Number(1.0), ExecuteOptions::default())
                }),
                Box::new(move || execute(&h, Value::String("bad".into()), ExecuteOptions::default())),
            ];
            let outcome = ctx.execute_parallel(items, ParallelOptions::default());
            assert_eq!(outcome.kind, ParallelOutcomeKind::Partial);
            assert_eq!(outcome.stats.succeeded, 1);
            assert_eq!(outcome.stats.failed, 1);
            assert!(outcome.aggregated_ko.is_none());
            ctx.ok(Value::Number(0.0))
        });

        execute(&outer, Value::Number(0.0), ExecuteOptions::default());
    }

    #[test]
    fn execute_parallel_fail_all_aggregates_every_result_into_one_ko() {
        let handler = doubling_handler();
        let outer = demo_definition().handler(provide(|_ctl| 0i64), move |_d, ctx, _n: i64| {
            let h = handler.clone();
            let items: Vec<Box<dyn FnOnce() -> FlowResult<i64, DemoError> + Send>> = vec![
                Box::new({
                    let h = h.clone();
                    move || execute(&h, Value::Number(1.0), ExecuteOptions::default())
                }),
                Box::new(move || execute(&h, Value::String("bad".into()), ExecuteOptions::default())),
            ];
            let options = ParallelOptions {
                failure_mode: FailureMode::FailAll,
                error_mapper: Some(Arc::new(|results: &[FlowResult<i64, DemoError>]| {
                    DemoError(format!("{} items failed", results.iter().filter(|r| r.is_ko()).count()))
                })),
                ..ParallelOptions::default()
            };
            let outcome = ctx.execute_parallel(items, options);
            assert_eq!(outcome.kind, ParallelOutcomeKind::Partial);
            assert_eq!(outcome.stats.total, 2);
            assert_eq!(outcome.results.len(), 2, "fail-all still runs every item");
            assert_eq!(outcome.aggregated_ko.unwrap().0, "1 items failed");
            ctx.ok(Value::Number(0.0))
        });

        execute(&outer, Value::Number(0.0), ExecuteOptions::default());
    }

    #[test]
    fn execute_parallel_fail_all_defaults_to_a_count_summary() {
        let handler = doubling_handler();
        let outer = demo_definition().handler(provide(|_ctl| 0i64), move |_d, ctx, _n: i64| {
            let h = handler.clone();
            let items: Vec<Box<dyn FnOnce() -> FlowResult<i64, DemoError> + Send>> = vec![
                Box::new(move || execute(&h, Value::String("bad".into()), ExecuteOptions::default())),
            ];
            let options = ParallelOptions {
                failure_mode: FailureMode::FailAll,
                ..ParallelOptions::default()
            };
            let outcome = ctx.execute_parallel(items, options);
            let DemoError(message) = outcome.aggregated_ko.unwrap();
            assert!(message.contains("1 of 1"));
            ctx.ok(Value::Number(0.0))
        });

        execute(&outer, Value::Number(0.0), ExecuteOptions::default());
    }
}
