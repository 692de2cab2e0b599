//! `Pod`: a layered overlay over a [`Scope`] for scoped overrides (a single
//! request, a single test case) without mutating the parent.
//!
//! The "shared" side of the overlay is the *whole* parent `Scope`, not one
//! lifetime tier: a pod never invokes a descriptor's factory itself, every
//! descriptor either has a pod-local override (set via `PodBuilder::preset`
//! or `Pod::update`) or is resolved, factory and all, by the parent. This
//! keeps a pod a true O(1) overlay rather than a transitive fork: one
//! overridden leaf does not retroactively recompute already-cached parent
//! descriptors that depend on it unless they too are resolved through the
//! pod (see `DESIGN.md`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::datastore::{DataStore, TagContainer};
use crate::descriptor::{DepResolver, Executor};
use crate::error::{GraphError, GraphResult};
use crate::extension::{AnyValue, Extension, ExtensionChain};
use crate::internal::CleanupList;
use crate::key::Key;
use crate::scope::{downcast_any, Accessor, Scope};
use crate::tag::Tag;

type RecomputeFn = Arc<dyn Fn(&Pod) -> GraphResult<AnyValue> + Send + Sync>;

/// What a preset binds a descriptor's pod-local override to: a fixed value,
/// or another descriptor resolved through the pod in its place.
enum PresetBinding {
    Value(AnyValue),
    Descriptor(RecomputeFn),
}

#[derive(Default)]
struct PodState {
    disposed: bool,
    cache: HashMap<Key, AnyValue>,
    presets: HashMap<Key, PresetBinding>,
    cleanup: HashMap<Key, CleanupList>,
    pinned: HashSet<Key>,
    resolution_order: Vec<Key>,
    tags: DataStore,
    on_change: Vec<Arc<dyn Fn(Key) + Send + Sync>>,
}

struct PodInner {
    parent: Scope,
    debug_name: String,
    extensions: ExtensionChain,
    state: Mutex<PodState>,
}

/// A scoped overlay: reads fall through to the parent [`Scope`] for anything
/// not locally overridden; writes land exclusively in the pod.
#[derive(Clone)]
pub struct Pod {
    inner: Arc<PodInner>,
}

/// Builds a [`Pod`] layered over a [`Scope`].
pub struct PodBuilder {
    parent: Scope,
    debug_name: Option<String>,
    extensions: Vec<Arc<dyn Extension>>,
    presets: Vec<(Key, PresetBinding)>,
}

impl PodBuilder {
    pub(crate) fn new(parent: Scope) -> Self {
        Self {
            parent,
            debug_name: None,
            extensions: Vec::new(),
            presets: Vec::new(),
        }
    }

    /// Sets a debug name surfaced to extensions' `init_pod` hook.
    pub fn debug_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }

    /// Registers a pod-specific extension, layered outside every extension
    /// inherited from the parent scope.
    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Overrides `exec`'s value within this pod, without touching the
    /// parent's cache.
    pub fn preset<T: Send + Sync + 'static>(mut self, exec: &Executor<T>, value: T) -> Self {
        self.presets.push((exec.key(), PresetBinding::Value(Arc::new(value) as AnyValue)));
        self
    }

    /// Overrides `exec`'s value within this pod to whatever `other` resolves
    /// to, instead of a fixed value. The first resolution of `exec` through
    /// this pod resolves `other` through this pod (so `other` itself may
    /// fall through to the parent scope) and caches that result under
    /// `exec`'s own key; `exec`'s own factory never runs.
    pub fn preset_descriptor<T: Send + Sync + 'static>(mut self, exec: &Executor<T>, other: &Executor<T>) -> Self {
        let other = other.clone();
        let resolve_other: RecomputeFn = Arc::new(move |pod: &Pod| pod.resolve(&other).map(|v| v as AnyValue));
        self.presets.push((exec.key(), PresetBinding::Descriptor(resolve_other)));
        self
    }

    /// Constructs the pod, running every extension's `init_pod` hook
    /// (inherited ones included).
    pub fn build(self) -> Pod {
        let debug_name = self.debug_name.unwrap_or_default();
        let mut extensions = self.parent.extensions();
        for ext in self.extensions {
            extensions.push(ext);
        }
        extensions.init_pod_all(&debug_name);

        let mut state = PodState::default();
        for (key, value) in self.presets {
            state.presets.insert(key, value);
        }

        Pod {
            inner: Arc::new(PodInner {
                parent: self.parent,
                debug_name,
                extensions,
                state: Mutex::new(state),
            }),
        }
    }
}

impl Pod {
    /// The debug name this pod was built with.
    pub fn debug_name(&self) -> &str {
        &self.inner.debug_name
    }

    /// The parent scope this pod overlays.
    pub fn parent(&self) -> &Scope {
        &self.inner.parent
    }

    pub(crate) fn extensions(&self) -> ExtensionChain {
        self.inner.extensions.clone()
    }

    /// Resolves `exec`: a pod-local override or previously pod-updated value
    /// if one exists, otherwise the parent scope's own resolution.
    pub fn resolve<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> GraphResult<Arc<T>> {
        let key = exec.key();

        loop {
            let mut guard = self.inner.state.lock().unwrap();
            if guard.disposed {
                return Err(GraphError::ScopeDisposed);
            }

            if let Some(value) = guard.cache.get(&key) {
                let value = value.clone();
                drop(guard);
                return downcast_any(value, key);
            }

            if let Some(binding) = guard.presets.remove(&key) {
                drop(guard);
                let resolved = match binding {
                    PresetBinding::Value(value) => Ok(value),
                    PresetBinding::Descriptor(resolve_other) => resolve_other(self),
                };
                let value = resolved?;
                let mut guard = self.inner.state.lock().unwrap();
                guard.cache.insert(key, value);
                if !guard.resolution_order.contains(&key) {
                    guard.resolution_order.push(key);
                }
                continue;
            }

            drop(guard);
            return self.inner.parent.resolve(exec);
        }
    }

    /// Builds an accessor over `exec`, delegating lazy/static delivery to
    /// the parent scope. A pod-local override is only honored by
    /// [`Pod::resolve`]/[`Pod::update`], not by accessors built this way.
    pub fn accessor<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> Accessor<T> {
        self.inner.parent.accessor(exec)
    }

    /// Overrides `exec`'s value within this pod, running its previous
    /// pod-local cleanup hooks first, without touching the parent's cache.
    pub fn update<T: Send + Sync + 'static>(&self, exec: &Executor<T>, value: T) -> GraphResult<Arc<T>> {
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

        let value = Arc::new(value);
        let mut guard = self.inner.state.lock().unwrap();
        guard.cache.insert(key, value.clone() as AnyValue);
        if !guard.resolution_order.contains(&key) {
            guard.resolution_order.push(key);
        }
        drop(guard);

        self.notify_change(key);
        Ok(value)
    }

    /// Forgets a pod-local override for `exec`, so a later `Pod::resolve`
    /// falls through to the parent again.
    pub fn release<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> GraphResult<()> {
        let key = exec.key();
        {
            let guard = self.inner.state.lock().unwrap();
            if guard.disposed {
                return Err(GraphError::ScopeDisposed);
            }
        }
        self.run_cleanup(key);
        let mut guard = self.inner.state.lock().unwrap();
        guard.cache.remove(&key);
        guard.resolution_order.retain(|k| *k != key);
        Ok(())
    }

    /// Disposes the pod: runs every pod-local cleanup hook in reverse
    /// resolution order, then every extension's `dispose_pod` hook. Never
    /// touches the parent scope.
    pub fn dispose_pod(&self) {
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
        self.inner.extensions.dispose_pod_all();
    }

    /// Registers `f` to run whenever a pod-local value is set or overridden.
    /// Returns a thunk that cancels it.
    pub fn on_change<F>(&self, f: F) -> Box<dyn FnOnce() + Send>
    where
        F: Fn(Key) + Send + Sync + 'static,
    {
        let hook: Arc<dyn Fn(Key) + Send + Sync> = Arc::new(f);
        let cancel_target = hook.clone();
        self.inner.state.lock().unwrap().on_change.push(hook);
        let pod = self.clone();
        Box::new(move || {
            pod.inner
                .state
                .lock()
                .unwrap()
                .on_change
                .retain(|h| !Arc::ptr_eq(h, &cancel_target));
        })
    }

    /// Every descriptor overridden or updated directly on this pod, in the
    /// order they were first set.
    pub fn entries(&self) -> Vec<(Key, &'static str)> {
        let guard = self.inner.state.lock().unwrap();
        guard.resolution_order.iter().map(|k| (*k, k.display_name())).collect()
    }

    /// Reads `tag`'s pod-local value, ignoring its default.
    pub fn tag_find<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<Arc<T>> {
        self.inner.state.lock().unwrap().tags.find(tag)
    }

    /// Reads `tag`'s pod-local value, falling back to its default factory.
    pub fn tag_get<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> GraphResult<Arc<T>> {
        self.inner.state.lock().unwrap().tags.get(tag)
    }

    /// Sets `tag`'s value on this pod.
    pub fn tag_set<T: Send + Sync + 'static>(&self, tag: &Tag<T>, value: T) {
        self.inner.state.lock().unwrap().tags.set(tag, value);
    }

    #[cfg(feature = "diagnostics")]
    pub fn to_debug_string(&self) -> String {
        let guard = self.inner.state.lock().unwrap();
        let mut out = format!("pod \"{}\" over scope \"{}\":\n", self.inner.debug_name, self.inner.parent.debug_name());
        for key in &guard.resolution_order {
            out.push_str(&format!("  {} (pod-local)\n", key.display_name()));
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
}

impl DepResolver for Pod {
    /// Resolves `exec` through this pod: a pod-local override if one
    /// exists, otherwise the parent scope's own (non-reactive) resolution.
    fn resolve_typed<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> GraphResult<Arc<T>> {
        self.resolve(exec)
    }

    /// Pods do not track their own reactive reverse edges: a value
    /// overridden on the pod is never recomputed, and anything falling
    /// through is tracked by the parent scope's own reverse-edge table.
    fn resolve_reactive_typed<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> GraphResult<Arc<T>> {
        self.resolve(exec)
    }

    fn accessor_typed<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> Accessor<T> {
        self.accessor(exec)
    }

    /// Pins `key` against further `Pod::update` calls. Does not affect the
    /// parent scope's own pinning.
    fn pin(&self, key: Key) {
        self.inner.state.lock().unwrap().pinned.insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::provide;

    #[test]
    fn falls_through_to_parent_when_not_overridden() {
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        let pod = scope.pod().build();

        assert_eq!(*pod.resolve(&base).unwrap(), 1);
        assert_eq!(*scope.resolve(&base).unwrap(), 1);
    }

    #[test]
    fn preset_overrides_without_touching_parent() {
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        let pod = scope.pod().preset(&base, 99).build();

        assert_eq!(*pod.resolve(&base).unwrap(), 99);
        assert_eq!(*scope.resolve(&base).unwrap(), 1);
    }

    #[test]
    fn preset_descriptor_overrides_with_substitute_resolution() {
        let base = provide(|_ctl| 1i32);
        let substitute = provide(|_ctl| 42i32);
        let scope = Scope::builder().build();
        let pod = scope.pod().preset_descriptor(&base, &substitute).build();

        assert_eq!(*pod.resolve(&base).unwrap(), 42);
        assert_eq!(*scope.resolve(&base).unwrap(), 1);
    }

    #[test]
    fn update_is_pod_local() {
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        let pod = scope.pod().build();

        pod.update(&base, 7).unwrap();
        assert_eq!(*pod.resolve(&base).unwrap(), 7);
        assert_eq!(*scope.resolve(&base).unwrap(), 1);
    }

    #[test]
    fn dep_resolver_pin_is_pod_local() {
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        let pod = scope.pod().build();

        DepResolver::pin(&pod, base.key());
        assert!(pod.update(&base, 2).is_err());
        // the parent scope's own pinning is unaffected
        assert!(scope.update(&base, 3).is_ok());
    }

    #[test]
    fn dep_resolver_resolve_typed_falls_through_to_parent() {
        let base = provide(|_ctl| 5i32);
        let scope = Scope::builder().build();
        let pod = scope.pod().build();

        let value = DepResolver::resolve_typed(&pod, &base).unwrap();
        assert_eq!(*value, 5);
    }

    #[test]
    fn dispose_pod_runs_local_cleanup_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let base = provide(|_ctl| 1i32);
        let scope = Scope::builder().build();
        let pod = scope.pod().build();

        pod.update(&base, 2).unwrap();
        let l = log.clone();
        let _ = pod.on_change(move |_| l.lock().unwrap().push("changed"));
        pod.dispose_pod();
        assert!(pod.resolve(&base).is_err());
        assert!(scope.resolve(&base).is_ok());
    }
}
