//! `Scope`: the owning host for descriptor resolution, caching, reactive
//! propagation, and cleanup.
//!
//! Resolution follows a "check cache under lock, release the lock, compute,
//! re-lock to insert" pattern throughout, so a factory never runs while
//! holding the state mutex. Concurrent resolution of the *same* descriptor is
//! deduplicated with an explicit pending slot rather than tolerated as
//! harmless duplicate work, since factories here may register cleanup
//! exactly once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::datastore::{DataStore, TagContainer};
use crate::descriptor::{Controller, ControllerHost, DepResolver, Executor};
use crate::error::{panic_message, GraphError, GraphResult};
use crate::extension::{AnyValue, Extension, ExtensionChain, ResolveOp};
use crate::internal::{with_circular_catch, CleanupList, ResolvingGuard};
use crate::key::Key;
use crate::tag::Tag;

pub(crate) fn downcast_any<T: Send + Sync + 'static>(value: AnyValue, key: Key) -> GraphResult<Arc<T>> {
    value.downcast::<T>().map_err(|_| GraphError::DependencyShape {
        expected: std::any::type_name::<T>(),
        found: key.display_name(),
    })
}

/// Runs a factory body, converting an ordinary panic into
/// `GraphError::FactoryExecution`. A `CircularPanic` payload is left alone
/// and resumed, so it keeps unwinding to the `with_circular_catch` frame
/// that owns the matching stack guard.
fn invoke_catching<T, F>(name: &'static str, f: F) -> GraphResult<T>
where
    F: FnOnce() -> GraphResult<T>,
{
    use std::panic::AssertUnwindSafe;
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            if payload.downcast_ref::<crate::error::CircularPanic>().is_some() {
                std::panic::resume_unwind(payload);
            }
            Err(GraphError::FactoryExecution {
                descriptor: name,
                cause: Arc::new(GraphError::UncaughtHandler {
                    message: panic_message(payload),
                }),
            })
        }
    }
}

type RecomputeFn = Arc<dyn Fn(&Scope) -> GraphResult<AnyValue> + Send + Sync>;

struct CacheSlot {
    value: AnyValue,
    recompute: RecomputeFn,
}

/// What a preset binds a descriptor's first resolution to: a fixed value, or
/// another descriptor resolved through the scope in its place.
enum PresetBinding {
    Value(AnyValue),
    Descriptor(RecomputeFn),
}

#[derive(Default)]
struct PendingSlot {
    result: Mutex<Option<GraphResult<AnyValue>>>,
    cv: Condvar,
}

impl PendingSlot {
    fn wait(&self) -> GraphResult<AnyValue> {
        let mut guard = self.result.lock().unwrap();
        while guard.is_none() {
            guard = self.cv.wait(guard).unwrap();
        }
        guard.clone().unwrap()
    }

    fn finish(&self, outcome: GraphResult<AnyValue>) {
        let mut guard = self.result.lock().unwrap();
        *guard = Some(outcome);
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct ScopeState {
    disposed: bool,
    cache: HashMap<Key, CacheSlot>,
    pending: HashMap<Key, Arc<PendingSlot>>,
    // A descriptor whose last resolution attempt failed. Cleared by
    // `release`; a fresh resolve while this entry exists re-raises the same
    // error rather than re-running the factory.
    rejected: HashMap<Key, GraphError>,
    reverse_edges: HashMap<Key, Vec<Key>>,
    cleanup: HashMap<Key, CleanupList>,
    pinned: HashSet<Key>,
    presets: HashMap<Key, PresetBinding>,
    resolution_order: Vec<Key>,
    tags: DataStore,
    on_change: Vec<Arc<dyn Fn(Key) + Send + Sync>>,
    on_release: Vec<Arc<dyn Fn(Key) + Send + Sync>>,
    on_error: Vec<Arc<dyn Fn(Key, &GraphError) + Send + Sync>>,
    subscribers: HashMap<Key, Vec<Arc<dyn Fn(AnyValue) + Send + Sync>>>,
}

struct ScopeInner {
    debug_name: String,
    extensions: ExtensionChain,
    state: Mutex<ScopeState>,
}

/// The owning host for a set of resolved descriptors.
///
/// A `Scope` is a thin `Arc` handle: cloning it shares the same cache,
/// reverse edges, and cleanup state. Build one with [`Scope::builder`].
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

/// Marker type for a [`ScopeBuilder`] still accepting configuration.
pub struct Initial;

/// Marker type for a [`ScopeBuilder`] whose configuration is frozen,
/// pending only construction.
pub struct Ready;

/// Builds a [`Scope`], threading through the type states [`Initial`] (still
/// configurable) and [`Ready`] (configuration frozen, awaiting `build`).
///
/// `ScopeBuilder<Initial>::build` is a convenience that calls `ready()`
/// first, so simple cases never need to name the state explicitly.
pub struct ScopeBuilder<S = Initial> {
    debug_name: Option<String>,
    extensions: Vec<Arc<dyn Extension>>,
    presets: Vec<(Key, PresetBinding)>,
    _state: std::marker::PhantomData<S>,
}

impl Default for ScopeBuilder<Initial> {
    fn default() -> Self {
        Self {
            debug_name: None,
            extensions: Vec::new(),
            presets: Vec::new(),
            _state: std::marker::PhantomData,
        }
    }
}

impl ScopeBuilder<Initial> {
    /// Starts a new builder with no extensions, presets, or debug name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a debug name surfaced to extensions (`Extension::init`) and
    /// diagnostics.
    pub fn debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }

    /// Registers an extension. Later registrations wrap earlier ones more
    /// tightly (see [`crate::extension::ExtensionChain::wrap`]).
    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Presets `exec`'s cache entry to `value`, so the first resolution
    /// returns it directly without running `exec`'s factory.
    pub fn preset<T: Send + Sync + 'static>(mut self, exec: &Executor<T>, value: T) -> Self {
        self.presets.push((exec.key(), PresetBinding::Value(Arc::new(value) as AnyValue)));
        self
    }

    /// Presets `exec`'s cache entry to whatever `other` resolves to, instead
    /// of a fixed value. The first resolution of `exec` resolves `other`
    /// through this scope and caches that result under `exec`'s own key;
    /// `exec`'s own factory never runs.
    pub fn preset_descriptor<T: Send + Sync + 'static>(mut self, exec: &Executor<T>, other: &Executor<T>) -> Self {
        let other = other.clone();
        let resolve_other: RecomputeFn =
            Arc::new(move |scope: &Scope| scope.resolve_value::<T>(&other, false).map(|v| v as AnyValue));
        self.presets.push((exec.key(), PresetBinding::Descriptor(resolve_other)));
        self
    }

    /// Freezes configuration, moving to the [`Ready`] state.
    pub fn ready(self) -> ScopeBuilder<Ready> {
        ScopeBuilder {
            debug_name: self.debug_name,
            extensions: self.extensions,
            presets: self.presets,
            _state: std::marker::PhantomData,
        }
    }

    /// Shorthand for `self.ready().build()`.
    pub fn build(self) -> Scope {
        self.ready().build()
    }
}

impl ScopeBuilder<Ready> {
    /// Constructs the scope, running every registered extension's `init` hook.
    pub fn build(self) -> Scope {
        let debug_name = self.debug_name.unwrap_or_default();
        let mut extensions = ExtensionChain::default();
        for ext in self.extensions {
            extensions.push(ext);
        }
        extensions.init_all(&debug_name);

        let mut state = ScopeState::default();
        for (key, value) in self.presets {
            state.presets.insert(key, value);
        }

        Scope {
            inner: Arc::new(ScopeInner {
                debug_name,
                extensions,
                state: Mutex::new(state),
            }),
        }
    }
}

/// A descriptor's state within a scope's cache, as observed without forcing
/// resolution.
pub enum ResolutionState<T> {
    /// Never resolved in this scope, and no resolution is in flight.
    Unresolved,
    /// A resolution is currently running (on this or another thread).
    Pending,
    /// Resolved and cached.
    Resolved(Arc<T>),
    /// The last resolution attempt failed and has not been released since.
    Rejected(GraphError),
}

/// A handle over a not-yet-forced dependency, produced by
/// `Executor::lazy`/`Executor::r#static` projections and
/// `Scope::accessor`/`Pod::accessor`.
#[derive(Clone)]
pub struct Accessor<T> {
    scope: Scope,
    exec: Executor<T>,
}

impl<T: Send + Sync + 'static> Accessor<T> {
    pub(crate) fn new(scope: Scope, exec: Executor<T>) -> Self {
        Self { scope, exec }
    }

    /// Identity key of the underlying descriptor.
    pub fn key(&self) -> Key {
        self.exec.key()
    }

    /// Forces resolution. `reactive` mirrors `Executor::reactive`: when
    /// `true`, a reverse edge is recorded from this descriptor to whichever
    /// descriptor is currently being resolved, so a later update re-runs it.
    pub fn resolve(&self, reactive: bool) -> GraphResult<Arc<T>> {
        self.scope.resolve_value(&self.exec, reactive)
    }

    /// Reports the descriptor's current state without forcing resolution.
    pub fn lookup(&self) -> ResolutionState<T> {
        self.scope.peek_state(&self.exec)
    }

    /// Reads the currently cached value, if any, without resolving.
    pub fn get(&self) -> Option<Arc<T>> {
        match self.lookup() {
            ResolutionState::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// Replaces the cached value, propagating to reactive dependents.
    pub fn update(&self, value: T) -> GraphResult<Arc<T>> {
        self.scope.update(&self.exec, value)
    }

    /// Derives the new value from the current one (resolving first if
    /// necessary), then replaces it.
    pub fn update_with<F>(&self, f: F) -> GraphResult<Arc<T>>
    where
        F: FnOnce(&T) -> T,
    {
        self.scope.update_with(&self.exec, f)
    }

    /// Forgets the cached value. See [`Scope::release`].
    pub fn release(&self, soft: bool) -> GraphResult<()> {
        self.scope.release(&self.exec, soft)
    }

    /// Registers `cb` to run on every successful resolve or update of this
    /// descriptor that changes its value. Returns a thunk that cancels the
    /// subscription; cancellation is idempotent.
    pub fn subscribe<F>(&self, cb: F) -> Box<dyn FnOnce() + Send>
    where
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        self.scope.subscribe_typed::<T, F>(self.exec.key(), cb)
    }
}

impl Scope {
    /// Starts building a new scope.
    pub fn builder() -> ScopeBuilder<Initial> {
        ScopeBuilder::new()
    }

    /// The debug name this scope was built with.
    pub fn debug_name(&self) -> &str {
        &self.inner.debug_name
    }

    pub(crate) fn extensions(&self) -> ExtensionChain {
        self.inner.extensions.clone()
    }

    /// Resolves `exec`, running its factory (and its dependencies') at most
    /// once per scope, caching the result.
    pub fn resolve<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> GraphResult<Arc<T>> {
        self.resolve_value(exec, false)
    }

    /// Builds an accessor over `exec` without forcing resolution.
    pub fn accessor<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> Accessor<T> {
        Accessor::new(self.clone(), exec.clone())
    }

    /// Reports `exec`'s current state without forcing resolution.
    pub(crate) fn peek_state<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> ResolutionState<T> {
        let key = exec.key();
        let guard = self.inner.state.lock().unwrap();
        if guard.disposed {
            return ResolutionState::Rejected(GraphError::ScopeDisposed);
        }
        if let Some(slot) = guard.cache.get(&key) {
            if let Ok(value) = downcast_any::<T>(slot.value.clone(), key) {
                return ResolutionState::Resolved(value);
            }
        }
        if guard.pending.contains_key(&key) {
            return ResolutionState::Pending;
        }
        if let Some(err) = guard.rejected.get(&key) {
            return ResolutionState::Rejected(err.clone());
        }
        ResolutionState::Unresolved
    }

    pub(crate) fn subscribe_typed<T, F>(&self, key: Key, cb: F) -> Box<dyn FnOnce() + Send>
    where
        T: Send + Sync + 'static,
        F: Fn(&Arc<T>) + Send + Sync + 'static,
    {
        let wrapped: Arc<dyn Fn(AnyValue) + Send + Sync> = Arc::new(move |value: AnyValue| {
            if let Ok(typed) = value.downcast::<T>() {
                cb(&typed);
            }
        });
        let cancel_target = wrapped.clone();
        self.inner
            .state
            .lock()
            .unwrap()
            .subscribers
            .entry(key)
            .or_default()
            .push(wrapped);
        let scope = self.clone();
        Box::new(move || {
            if let Some(list) = scope.inner.state.lock().unwrap().subscribers.get_mut(&key) {
                list.retain(|h| !Arc::ptr_eq(h, &cancel_target));
            }
        })
    }

    fn notify_subscribers(&self, key: Key, value: &AnyValue) {
        let hooks: Vec<Arc<dyn Fn(AnyValue) + Send + Sync>> =
            self.inner.state.lock().unwrap().subscribers.get(&key).cloned().unwrap_or_default();
        for hook in hooks {
            hook(value.clone());
        }
    }

    /// Replaces `exec`'s cached value with `value`, running its old cleanup
    /// hooks first and propagating to every descriptor that reached it via
    /// a [`Executor::reactive`] edge.
    pub fn update<T: Send + Sync + 'static>(&self, exec: &Executor<T>, value: T) -> GraphResult<Arc<T>> {
        self.apply_update(exec, Arc::new(value))
    }

    /// Like [`Scope::update`], but derives the new value from the current
    /// one (resolving `exec` first if it has never run).
    pub fn update_with<T, F>(&self, exec: &Executor<T>, f: F) -> GraphResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        let current = self.resolve(exec)?;
        let next = f(&current);
        self.apply_update(exec, Arc::new(next))
    }

    fn apply_update<T: Send + Sync + 'static>(&self, exec: &Executor<T>, new_value: Arc<T>) -> GraphResult<Arc<T>> {
        let key = exec.key();
        {
            let guard = self.inner.state.lock().unwrap();
            if guard.disposed {
                return Err(GraphError::ScopeDisposed);
            }
            if guard.pinned.contains(&key) {
                return Err(GraphError::DependencyShape {
                    expected: "non-static descriptor",
                    found: key.display_name(),
                });
            }
        }

        self.run_cleanup(key);

        let wrapped = self
            .inner
            .extensions
            .wrap(ResolveOp::Update, key, || Ok(new_value.clone() as AnyValue))?;
        let typed: Arc<T> = downcast_any(wrapped, key)?;

        let exec_clone = exec.clone();
        let recompute: RecomputeFn = Arc::new(move |scope: &Scope| {
            scope.inner.state.lock().unwrap().cache.remove(&exec_clone.key());
            scope.resolve_value::<T>(&exec_clone, false).map(|v| v as AnyValue)
        });

        {
            let mut guard = self.inner.state.lock().unwrap();
            guard.rejected.remove(&key);
            guard.cache.insert(
                key,
                CacheSlot {
                    value: typed.clone() as AnyValue,
                    recompute,
                },
            );
            if !guard.resolution_order.contains(&key) {
                guard.resolution_order.push(key);
            }
        }

        self.notify_change(key);
        self.notify_subscribers(key, &(typed.clone() as AnyValue));
        self.propagate(key);

        Ok(typed)
    }

    /// Forgets `exec`'s cached value, running its cleanup hooks. When `soft`
    /// is `false`, also forgets its reverse edges, cleanup registrations,
    /// and pinned status, so a later resolution behaves as if `exec` had
    /// never been touched in this scope.
    pub fn release<T: Send + Sync + 'static>(&self, exec: &Executor<T>, soft: bool) -> GraphResult<()> {
        let key = exec.key();
        {
            let guard = self.inner.state.lock().unwrap();
            if guard.disposed {
                return Err(GraphError::ScopeDisposed);
            }
        }
        self.run_cleanup(key);
        {
            let mut guard = self.inner.state.lock().unwrap();
            guard.cache.remove(&key);
            guard.rejected.remove(&key);
            guard.resolution_order.retain(|k| *k != key);
            if !soft {
                guard.reverse_edges.remove(&key);
                guard.cleanup.remove(&key);
                guard.pinned.remove(&key);
            }
        }
        self.notify_release(key);
        Ok(())
    }

    /// Disposes the scope: runs every resolved descriptor's cleanup hooks in
    /// reverse resolution order, then every extension's `dispose` hook.
    /// Every operation after this errors with `GraphError::ScopeDisposed`.
    pub fn dispose(&self) {
        let order = {
            let mut guard = self.inner.state.lock().unwrap();
            if guard.disposed {
                return;
            }
            guard.disposed = true;
            guard.resolution_order.clone()
        };
        for key in order.into_iter().rev() {
            self.run_cleanup(key);
        }
        self.inner.extensions.dispose_all();
    }

    /// Starts building a [`crate::pod::Pod`] layered over this scope.
    pub fn pod(&self) -> crate::pod::PodBuilder {
        crate::pod::PodBuilder::new(self.clone())
    }

    /// Registers `f` to run whenever any descriptor's value changes (direct
    /// `update` or reactive recomputation). Returns a thunk that cancels it.
    pub fn on_change<F>(&self, f: F) -> Box<dyn FnOnce() + Send>
    where
        F: Fn(Key) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(Key) + Send + Sync> = Arc::new(f);
        let cancel_target = hook.clone();
        self.inner.state.lock().unwrap().on_change.push(hook);
        let scope = self.clone();
        Box::new(move || {
            scope
                .inner
                .state
                .lock()
                .unwrap()
                .on_change
                .retain(|h| !Arc::ptr_eq(h, &cancel_target));
        })
    }

    /// Registers `f` to run whenever any descriptor is released (explicitly
    /// or via `dispose`). Returns a thunk that cancels it.
    pub fn on_release<F>(&self, f: F) -> Box<dyn FnOnce() + Send>
    where
        F: Fn(Key) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(Key) + Send + Sync> = Arc::new(f);
        let cancel_target = hook.clone();
        self.inner.state.lock().unwrap().on_release.push(hook);
        let scope = self.clone();
        Box::new(move || {
            scope
                .inner
                .state
                .lock()
                .unwrap()
                .on_release
                .retain(|h| !Arc::ptr_eq(h, &cancel_target));
        })
    }

    /// Registers `f` to run whenever a resolution fails. Returns a thunk
    /// that cancels it.
    pub fn on_error<F>(&self, f: F) -> Box<dyn FnOnce() + Send>
    where
        F: Fn(Key, &GraphError) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(Key, &GraphError) + Send + Sync> = Arc::new(f);
        let cancel_target = hook.clone();
        self.inner.state.lock().unwrap().on_error.push(hook);
        let scope = self.clone();
        Box::new(move || {
            scope
                .inner
                .state
                .lock()
                .unwrap()
                .on_error
                .retain(|h| !Arc::ptr_eq(h, &cancel_target));
        })
    }

    /// Every descriptor resolved so far, in resolution order.
    pub fn entries(&self) -> Vec<(Key, &'static str)> {
        let guard = self.inner.state.lock().unwrap();
        guard.resolution_order.iter().map(|k| (*k, k.display_name())).collect()
    }

    /// Reads `tag`'s value, ignoring its default.
    pub fn tag_find<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<Arc<T>> {
        self.inner.state.lock().unwrap().tags.find(tag)
    }

    /// Reads `tag`'s value, falling back to its default factory.
    pub fn tag_get<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> GraphResult<Arc<T>> {
        self.inner.state.lock().unwrap().tags.get(tag)
    }

    /// Sets `tag`'s value on this scope.
    pub fn tag_set<T: Send + Sync + 'static>(&self, tag: &Tag<T>, value: T) {
        self.inner.state.lock().unwrap().tags.set(tag, value);
    }

    /// Dumps every resolved descriptor and its reactive reverse edges.
    #[cfg(feature = "diagnostics")]
    pub fn to_debug_string(&self) -> String {
        let guard = self.inner.state.lock().unwrap();
        let mut out = format!("scope \"{}\":\n", self.inner.debug_name);
        for key in &guard.resolution_order {
            out.push_str(&format!("  {}\n", key.display_name()));
            if let Some(dependents) = guard.reverse_edges.get(key) {
                for dependent in dependents {
                    out.push_str(&format!("    -> reactively notifies {}\n", dependent.display_name()));
                }
            }
        }
        out
    }

    fn run_cleanup(&self, key: Key) {
        let mut guard = self.inner.state.lock().unwrap();
        if let Some(list) = guard.cleanup.get_mut(&key) {
            list.run_reverse();
        }
    }

    fn notify_change(&self, key: Key) {
        let hooks: Vec<Arc<dyn Fn(Key) + Send + Sync>> = self.inner.state.lock().unwrap().on_change.clone();
        for hook in hooks {
            hook(key);
        }
    }

    fn notify_release(&self, key: Key) {
        let hooks: Vec<Arc<dyn Fn(Key) + Send + Sync>> = self.inner.state.lock().unwrap().on_release.clone();
        for hook in hooks {
            hook(key);
        }
    }

    fn notify_error(&self, key: Key, error: &GraphError) {
        self.inner.extensions.notify_error(key, error);
        let hooks: Vec<Arc<dyn Fn(Key, &GraphError) + Send + Sync>> =
            self.inner.state.lock().unwrap().on_error.clone();
        for hook in hooks {
            hook(key, error);
        }
    }

    fn record_reactive_edge(&self, key: Key, reactive_edge: bool) {
        if !reactive_edge {
            return;
        }
        if let Some(dependent) = crate::internal::resolving::current() {
            let mut guard = self.inner.state.lock().unwrap();
            let dependents = guard.reverse_edges.entry(key).or_default();
            if !dependents.contains(&dependent) {
                dependents.push(dependent);
            }
        }
    }

    /// Invalidates and recomputes every descriptor that reached `start` via
    /// a reactive edge, breadth-first, each visited at most once.
    fn propagate(&self, start: Key) {
        let mut queue: VecDeque<Key> = VecDeque::new();
        let mut visited: HashSet<Key> = HashSet::new();
        visited.insert(start);

        {
            let guard = self.inner.state.lock().unwrap();
            if let Some(dependents) = guard.reverse_edges.get(&start) {
                queue.extend(dependents.iter().copied());
            }
        }

        while let Some(dependent) = queue.pop_front() {
            if !visited.insert(dependent) {
                continue;
            }

            let recompute = {
                let guard = self.inner.state.lock().unwrap();
                guard.cache.get(&dependent).map(|slot| slot.recompute.clone())
            };
            let Some(recompute) = recompute else { continue };

            self.run_cleanup(dependent);
            match recompute(self) {
                Ok(new_value) => {
                    {
                        let mut guard = self.inner.state.lock().unwrap();
                        guard.rejected.remove(&dependent);
                        if let Some(slot) = guard.cache.get_mut(&dependent) {
                            slot.value = new_value.clone();
                        }
                    }
                    self.notify_change(dependent);
                    self.notify_subscribers(dependent, &new_value);
                    let guard = self.inner.state.lock().unwrap();
                    if let Some(further) = guard.reverse_edges.get(&dependent) {
                        queue.extend(further.iter().copied());
                    }
                }
                Err(e) => {
                    self.notify_error(dependent, &e);
                }
            }
        }
    }

    pub(crate) fn resolve_value<T: Send + Sync + 'static>(
        &self,
        exec: &Executor<T>,
        reactive_edge: bool,
    ) -> GraphResult<Arc<T>> {
        let key = exec.key();

        loop {
            let mut guard = self.inner.state.lock().unwrap();
            if guard.disposed {
                return Err(GraphError::ScopeDisposed);
            }

            if let Some(slot) = guard.cache.get(&key) {
                let value = slot.value.clone();
                drop(guard);
                self.record_reactive_edge(key, reactive_edge);
                return downcast_any(value, key);
            }

            if let Some(err) = guard.rejected.get(&key).cloned() {
                drop(guard);
                self.record_reactive_edge(key, reactive_edge);
                return Err(err);
            }

            if let Some(binding) = guard.presets.remove(&key) {
                let slot = Arc::new(PendingSlot::default());
                guard.pending.insert(key, slot.clone());
                drop(guard);

                let substituted: Option<RecomputeFn> = match &binding {
                    PresetBinding::Value(_) => None,
                    PresetBinding::Descriptor(resolve_other) => Some(resolve_other.clone()),
                };
                let outcome: GraphResult<AnyValue> = match &binding {
                    PresetBinding::Value(value) => Ok(value.clone()),
                    PresetBinding::Descriptor(resolve_other) => resolve_other(self),
                };

                {
                    let mut guard = self.inner.state.lock().unwrap();
                    guard.pending.remove(&key);
                    match &outcome {
                        Ok(value) => {
                            guard.rejected.remove(&key);
                            let recompute: RecomputeFn = match substituted {
                                Some(resolve_other) => resolve_other,
                                None => {
                                    let value = value.clone();
                                    Arc::new(move |_scope: &Scope| Ok(value.clone()))
                                }
                            };
                            guard.cache.insert(key, CacheSlot { value: value.clone(), recompute });
                            if !guard.resolution_order.contains(&key) {
                                guard.resolution_order.push(key);
                            }
                        }
                        Err(e) => {
                            guard.rejected.insert(key, e.clone());
                        }
                    }
                }

                slot.finish(outcome.clone());

                match &outcome {
                    Ok(value) => self.notify_subscribers(key, value),
                    Err(e) => self.notify_error(key, e),
                }

                self.record_reactive_edge(key, reactive_edge);
                return outcome.and_then(|v| downcast_any(v, key));
            }

            if let Some(pending) = guard.pending.get(&key).cloned() {
                drop(guard);
                let outcome = pending.wait();
                self.record_reactive_edge(key, reactive_edge);
                return outcome.and_then(|v| downcast_any(v, key));
            }

            let slot = Arc::new(PendingSlot::default());
            guard.pending.insert(key, slot.clone());
            drop(guard);

            let ctl = Controller::new(self, key);
            let extensions = self.inner.extensions.clone();
            let name = exec.name();
            let outcome: GraphResult<AnyValue> = with_circular_catch(key, || {
                extensions.wrap(ResolveOp::Resolve, key, || {
                    let _resolving = ResolvingGuard::push(key);
                    invoke_catching(name, || exec.invoke(self, &ctl)).map(|v| Arc::new(v) as AnyValue)
                })
            });

            {
                let mut guard = self.inner.state.lock().unwrap();
                guard.pending.remove(&key);
                match &outcome {
                    Ok(value) => {
                        guard.rejected.remove(&key);
                        let exec_clone = exec.clone();
                        let recompute: RecomputeFn = Arc::new(move |scope: &Scope| {
                            scope.inner.state.lock().unwrap().cache.remove(&exec_clone.key());
                            scope.resolve_value::<T>(&exec_clone, false).map(|v| v as AnyValue)
                        });
                        guard.cache.insert(
                            key,
                            CacheSlot {
                                value: value.clone(),
                                recompute,
                            },
                        );
                        if !guard.resolution_order.contains(&key) {
                            guard.resolution_order.push(key);
                        }
                    }
                    Err(e) => {
                        guard.rejected.insert(key, e.clone());
                    }
                }
            }

            slot.finish(outcome.clone());

            match &outcome {
                Ok(value) => self.notify_subscribers(key, value),
                Err(e) => self.notify_error(key, e),
            }

            self.record_reactive_edge(key, reactive_edge);
            return outcome.and_then(|v| downcast_any(v, key));
        }
    }
}

impl DepResolver for Scope {
    fn resolve_typed<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> GraphResult<Arc<T>> {
        self.resolve_value(exec, false)
    }

    fn resolve_reactive_typed<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> GraphResult<Arc<T>> {
        self.resolve_value(exec, true)
    }

    fn accessor_typed<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> Accessor<T> {
        Accessor::new(self.clone(), exec.clone())
    }

    fn pin(&self, key: Key) {
        self.inner.state.lock().unwrap().pinned.insert(key);
    }
}

impl ControllerHost for Scope {
    fn push_cleanup(&self, key: Key, cleanup: Box<dyn FnOnce() + Send>) {
        self.inner.state.lock().unwrap().cleanup.entry(key).or_default().push(cleanup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{derive, provide};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn resolves_and_caches() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c2 = counter.clone();
        let exec = provide(move |_ctl| {
            c2.fetch_add(1, Ordering::SeqCst);
            42i32
        });

        let scope = Scope::builder().build();
        assert_eq!(*scope.resolve(&exec).unwrap(), 42);
        assert_eq!(*scope.resolve(&exec).unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_replaces_cached_value() {
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        assert_eq!(*scope.resolve(&base).unwrap(), 1);
        scope.update(&base, 99).unwrap();
        assert_eq!(*scope.resolve(&base).unwrap(), 99);
    }

    #[test]
    fn reactive_dependents_recompute_on_update() {
        let count = provide(|_ctl| 1i32);
        let doubled = derive(count.reactive(), |n, _ctl| *n * 2);

        let scope = Scope::builder().build();
        assert_eq!(*scope.resolve(&doubled).unwrap(), 2);
        scope.update(&count, 10).unwrap();
        assert_eq!(*scope.resolve(&doubled).unwrap(), 20);
    }

    #[test]
    fn default_edge_does_not_propagate() {
        let count = provide(|_ctl| 1i32);
        let doubled = derive(count.clone(), |n, _ctl| *n * 2);

        let scope = Scope::builder().build();
        assert_eq!(*scope.resolve(&doubled).unwrap(), 2);
        scope.update(&count, 10).unwrap();
        // `doubled` depended on `count` via a plain (default) edge, so it
        // keeps its stale cached value until resolved again after release.
        assert_eq!(*scope.resolve(&doubled).unwrap(), 2);
    }

    #[test]
    fn static_edge_pins_upstream_against_update() {
        let base = provide(|_ctl| 1i32);
        let pinned_reader = derive(base.r#static(), |accessor, _ctl| *accessor.resolve(false).unwrap());

        let scope = Scope::builder().build();
        assert_eq!(*scope.resolve(&pinned_reader).unwrap(), 1);
        assert!(scope.update(&base, 2).is_err());
    }

    #[test]
    fn cleanup_runs_lifo_on_release() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = log.clone();
        let l2 = log.clone();
        let exec = provide(move |ctl| {
            let la = l1.clone();
            ctl.cleanup(move || la.lock().unwrap().push("a"));
            let lb = l2.clone();
            ctl.cleanup(move || lb.lock().unwrap().push("b"));
            1i32
        });

        let scope = Scope::builder().build();
        scope.resolve(&exec).unwrap();
        scope.release(&exec, false).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn dispose_rejects_further_operations() {
        let exec = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        scope.resolve(&exec).unwrap();
        scope.dispose();
        assert!(matches!(scope.resolve(&exec), Err(GraphError::ScopeDisposed)));
    }

    #[test]
    fn preset_short_circuits_factory() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r2 = ran.clone();
        let exec = provide(move |_ctl| {
            r2.fetch_add(1, Ordering::SeqCst);
            1i32
        });

        let scope = Scope::builder().preset(&exec, 7).build();
        assert_eq!(*scope.resolve(&exec).unwrap(), 7);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn preset_descriptor_resolves_substitute_instead_of_factory() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r2 = ran.clone();
        let original = provide(move |_ctl| {
            r2.fetch_add(1, Ordering::SeqCst);
            1i32
        });
        let substitute = provide(|_ctl| 99i32);

        let scope = Scope::builder().preset_descriptor(&original, &substitute).build();
        assert_eq!(*scope.resolve(&original).unwrap(), 99);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(*scope.resolve(&substitute).unwrap(), 99);
    }

    #[test]
    fn preset_descriptor_propagates_substitute_failure() {
        let original = provide(|_ctl| 1i32);
        let failing: Executor<i32> = provide(|_ctl| panic!("substitute factory failed"));

        let scope = Scope::builder().preset_descriptor(&original, &failing).build();
        assert!(scope.resolve(&original).is_err());
    }

    #[test]
    fn on_change_fires_on_direct_update() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        let _cancel = scope.on_change(move |key| seen2.lock().unwrap().push(key));
        scope.resolve(&base).unwrap();
        scope.update(&base, 2).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn subscribe_fires_before_update_returns() {
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let accessor = scope.accessor(&base);
        let _cancel = accessor.subscribe(move |v| seen2.lock().unwrap().push(**v));
        scope.update(&base, 7).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn subscribe_cancel_is_idempotent() {
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let accessor = scope.accessor(&base);
        let cancel = accessor.subscribe(move |_v| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        cancel();
        cancel_noop_marker();
        scope.update(&base, 2).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    fn cancel_noop_marker() {}

    #[test]
    fn lookup_reports_unresolved_then_resolved() {
        let base = provide(|_ctl| 5i32);
        let scope = Scope::builder().build();
        let accessor = scope.accessor(&base);
        assert!(matches!(accessor.lookup(), ResolutionState::Unresolved));
        assert!(accessor.get().is_none());
        scope.resolve(&base).unwrap();
        match accessor.lookup() {
            ResolutionState::Resolved(v) => assert_eq!(*v, 5),
            _ => panic!("expected resolved"),
        }
        assert_eq!(*accessor.get().unwrap(), 5);
    }

    #[test]
    fn failed_resolve_poisons_until_release() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a2 = attempts.clone();
        let flaky = provide(move |_ctl| -> i32 {
            a2.fetch_add(1, Ordering::SeqCst);
            panic!("boom")
        });

        let scope = Scope::builder().build();
        assert!(scope.resolve(&flaky).is_err());
        assert!(scope.resolve(&flaky).is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "no automatic retry");

        let accessor = scope.accessor(&flaky);
        assert!(matches!(accessor.lookup(), ResolutionState::Rejected(_)));

        scope.release(&flaky, false).unwrap();
        // release clears the poison; nothing left to retry against a panicking
        // factory, but the state is unresolved again rather than stuck rejected.
        assert!(matches!(accessor.lookup(), ResolutionState::Unresolved));
    }

    #[test]
    fn same_typed_descriptors_do_not_false_positive_as_cyclic() {
        let base = provide(|_ctl| 1i32);
        let plus_one = derive(base.clone(), |n, _ctl| *n + 1);
        let plus_two = derive(plus_one.clone(), |n, _ctl| *n + 1);

        let scope = Scope::builder().build();
        assert_eq!(*scope.resolve(&plus_two).unwrap(), 3);
    }

    #[test]
    fn lazy_accessor_does_not_force_resolution() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r2 = ran.clone();
        let base = provide(move |_ctl| {
            r2.fetch_add(1, Ordering::SeqCst);
            1i32
        });
        let reader = derive(base.lazy(), |_accessor, _ctl| "built".to_string());

        let scope = Scope::builder().build();
        scope.resolve(&reader).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
