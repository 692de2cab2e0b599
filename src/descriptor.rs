//! Executor descriptors: the nodes of the dependency-resolution graph.
//!
//! A descriptor is built once with [`provide`] or [`derive`] and is
//! immutable afterward: there is no `set_*` method anywhere on
//! [`Executor`]. Its identity is the address of its backing allocation
//! (see [`crate::key`]), not its declared dependencies or factory, so two
//! descriptors built from identical arguments are still distinct graph
//! nodes.

use std::any::Any;
use std::sync::Arc;

use crate::datastore::{DataStore, TagContainer};
use crate::error::GraphResult;
use crate::key::Key;
use crate::tag::Tag;
use crate::variant::Variant;

/// Declared shape of a descriptor's dependencies, used for introspection,
/// cycle-path construction, and diagnostics.
///
/// This is the type-erased counterpart of the [`Dependencies`] trait that
/// `derive` is generic over; every [`AnyExecutor`] reachable from a
/// `DepSpec` shares identity with the `Executor<T>` it was projected from.
#[derive(Clone)]
pub enum DepSpec {
    /// A descriptor with no declared dependencies (built with `provide`).
    None,
    /// A single upstream dependency.
    Single(AnyExecutor),
    /// An ordered list of same-shaped dependencies.
    List(Vec<AnyExecutor>),
    /// An ordered, possibly-repeating-key map of dependencies.
    Map(Vec<(&'static str, AnyExecutor)>),
}

impl DepSpec {
    /// Every `AnyExecutor` this dependency declaration reaches, in
    /// declaration order.
    pub fn executors(&self) -> Vec<&AnyExecutor> {
        match self {
            DepSpec::None => Vec::new(),
            DepSpec::Single(e) => vec![e],
            DepSpec::List(list) => list.iter().collect(),
            DepSpec::Map(map) => map.iter().map(|(_, e)| e).collect(),
        }
    }
}

/// Narrow interface a `Scope`/`Pod` exposes so dependency resolution can
/// happen without `descriptor` depending on `scope`. Factories never see the
/// concrete `Scope` type, only this seam.
pub trait DepResolver {
    /// Resolves `exec` within the calling host, downcasting to `Arc<T>`.
    /// Used for plain (`default`-variant) dependency edges: no reverse edge
    /// is recorded, so an upstream update never re-runs the caller.
    fn resolve_typed<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> GraphResult<Arc<T>>;

    /// Resolves `exec` and records a reactive reverse edge from `exec` to
    /// whichever descriptor is currently being resolved through this host,
    /// so a later `Scope::update(exec, ..)` re-runs the caller.
    fn resolve_reactive_typed<T: Send + Sync + 'static>(
        &self,
        exec: &Executor<T>,
    ) -> GraphResult<Arc<T>>;

    /// Builds an accessor over `exec` within the calling host without
    /// forcing resolution.
    fn accessor_typed<T: Send + Sync + 'static>(&self, exec: &Executor<T>) -> crate::scope::Accessor<T>;

    /// Permanently pins the descriptor keyed by `key`: a later
    /// `Scope::update`/`Pod` write targeting it is rejected with
    /// `GraphError::DependencyShape`. Called once by [`StaticDep::resolve`]
    /// after forcing eager resolution; there is no way to unpin.
    fn pin(&self, key: Key);
}

/// Narrow interface for registering per-resolution cleanup, implemented by
/// `Scope`/`Pod`. Kept separate from [`DepResolver`] so `Controller` can be
/// constructed even where only cleanup registration is needed.
pub trait ControllerHost {
    /// Registers `cleanup` to run when the descriptor keyed by `key` is
    /// released, updated away, or the owning scope is disposed.
    fn push_cleanup(&self, key: Key, cleanup: Box<dyn FnOnce() + Send>);
}

/// Handle passed to every factory, giving it a place to register teardown.
/// Descriptors here are plain values, so teardown is registered as an
/// arbitrary closure rather than through a `Dispose`-implementing type.
pub struct Controller<'a> {
    host: &'a dyn ControllerHost,
    key: Key,
}

impl<'a> Controller<'a> {
    pub(crate) fn new(host: &'a dyn ControllerHost, key: Key) -> Self {
        Self { host, key }
    }

    /// Registers a closure to run when this descriptor's cached value is
    /// torn down (release, invalidating update, or scope disposal).
    pub fn cleanup<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.host.push_cleanup(self.key, Box::new(f));
    }
}

/// Typed dependency declaration accepted by [`derive`].
///
/// Implemented for a bare `Executor<T>` (a single dependency), `Vec<Executor<T>>`
/// (a list), `Vec<(&'static str, Executor<T>)>` (an ordered map), and tuples
/// of up to three `Dependencies` implementors (compound dependencies).
pub trait Dependencies: Send + Sync + 'static {
    /// The resolved value handed to the factory.
    type Output: Send + Sync + 'static;

    /// Builds the type-erased [`DepSpec`] for introspection.
    fn spec(&self) -> DepSpec;

    /// Resolves every declared dependency through `host`.
    fn resolve(&self, host: &dyn DepResolver) -> GraphResult<Self::Output>;
}

impl<T: Send + Sync + 'static> Dependencies for Executor<T> {
    type Output = Arc<T>;

    fn spec(&self) -> DepSpec {
        DepSpec::Single(self.clone().into_any())
    }

    fn resolve(&self, host: &dyn DepResolver) -> GraphResult<Self::Output> {
        host.resolve_typed(self).map_err(|e| wrap_dependency_error(e, self.inner.name))
    }
}

/// Labels `cause` as having failed while resolving `failing_dependency` for
/// whichever descriptor's factory is currently running, if any.
fn wrap_dependency_error(
    cause: crate::error::GraphError,
    failing_dependency: &'static str,
) -> crate::error::GraphError {
    match crate::internal::resolving::current() {
        Some(dependent) => cause.into_dependency_resolution(dependent.display_name(), failing_dependency),
        None => cause,
    }
}

/// A dependency declaration projecting an [`Executor::reactive`] edge.
///
/// Built by `Executor::reactive`, never directly.
pub struct ReactiveDep<T> {
    exec: Executor<T>,
}

/// A dependency declaration projecting an [`Executor::lazy`] edge.
pub struct LazyDep<T> {
    exec: Executor<T>,
}

/// A dependency declaration projecting an [`Executor::r#static`] edge.
pub struct StaticDep<T> {
    exec: Executor<T>,
}

impl<T> ReactiveDep<T> {
    /// Identity key of the underlying descriptor, unaffected by the projection.
    pub fn key(&self) -> Key
    where
        T: Send + Sync + 'static,
    {
        self.exec.key()
    }
}

impl<T> LazyDep<T> {
    /// Identity key of the underlying descriptor, unaffected by the projection.
    pub fn key(&self) -> Key
    where
        T: Send + Sync + 'static,
    {
        self.exec.key()
    }
}

impl<T> StaticDep<T> {
    /// Identity key of the underlying descriptor, unaffected by the projection.
    pub fn key(&self) -> Key
    where
        T: Send + Sync + 'static,
    {
        self.exec.key()
    }
}

impl<T: Send + Sync + 'static> Dependencies for ReactiveDep<T> {
    type Output = Arc<T>;

    fn spec(&self) -> DepSpec {
        DepSpec::Single(self.exec.clone().into_variant_any(Variant::Reactive))
    }

    fn resolve(&self, host: &dyn DepResolver) -> GraphResult<Self::Output> {
        host.resolve_reactive_typed(&self.exec)
            .map_err(|e| wrap_dependency_error(e, self.exec.inner.name))
    }
}

impl<T: Send + Sync + 'static> Dependencies for LazyDep<T> {
    type Output = crate::scope::Accessor<T>;

    fn spec(&self) -> DepSpec {
        DepSpec::Single(self.exec.clone().into_variant_any(Variant::Lazy))
    }

    fn resolve(&self, host: &dyn DepResolver) -> GraphResult<Self::Output> {
        Ok(host.accessor_typed(&self.exec))
    }
}

impl<T: Send + Sync + 'static> Dependencies for StaticDep<T> {
    type Output = crate::scope::Accessor<T>;

    fn spec(&self) -> DepSpec {
        DepSpec::Single(self.exec.clone().into_variant_any(Variant::Static))
    }

    fn resolve(&self, host: &dyn DepResolver) -> GraphResult<Self::Output> {
        let accessor = host.accessor_typed(&self.exec);
        accessor
            .resolve(false)
            .map_err(|e| wrap_dependency_error(e, self.exec.inner.name))?;
        host.pin(self.exec.key());
        Ok(accessor)
    }
}

impl<T: Send + Sync + 'static> Dependencies for Vec<Executor<T>> {
    type Output = Vec<Arc<T>>;

    fn spec(&self) -> DepSpec {
        DepSpec::List(self.iter().map(|e| e.clone().into_any()).collect())
    }

    fn resolve(&self, host: &dyn DepResolver) -> GraphResult<Self::Output> {
        self.iter()
            .map(|e| host.resolve_typed(e).map_err(|err| wrap_dependency_error(err, e.inner.name)))
            .collect()
    }
}

impl<T: Send + Sync + 'static> Dependencies for Vec<(&'static str, Executor<T>)> {
    type Output = Vec<(&'static str, Arc<T>)>;

    fn spec(&self) -> DepSpec {
        DepSpec::Map(
            self.iter()
                .map(|(name, e)| (*name, e.clone().into_any()))
                .collect(),
        )
    }

    fn resolve(&self, host: &dyn DepResolver) -> GraphResult<Self::Output> {
        self.iter()
            .map(|(name, e)| {
                host.resolve_typed(e)
                    .map(|v| (*name, v))
                    .map_err(|err| wrap_dependency_error(err, e.inner.name))
            })
            .collect()
    }
}

macro_rules! impl_tuple_dependencies {
    ($($idx:tt => $name:ident),+) => {
        impl<$($name: Dependencies),+> Dependencies for ($($name,)+) {
            type Output = ($($name::Output,)+);

            fn spec(&self) -> DepSpec {
                DepSpec::Map(vec![$(
                    {
                        let sub = self.$idx.spec();
                        // Tuple members contribute their own executors under a
                        // positional label; compound members flatten to their
                        // first executor for diagnostics purposes.
                        let label: &'static str = stringify!($idx);
                        let exec = sub.executors().into_iter().next().cloned()
                            .expect("Dependencies::spec() of a tuple member must reach at least one executor");
                        (label, exec)
                    }
                ),+])
            }

            fn resolve(&self, host: &dyn DepResolver) -> GraphResult<Self::Output> {
                Ok(($(self.$idx.resolve(host)?,)+))
            }
        }
    };
}

impl_tuple_dependencies!(0 => A, 1 => B);
impl_tuple_dependencies!(0 => A, 1 => B, 2 => C);

type SyncFactory<T> = dyn Fn(&dyn DepResolver, &Controller) -> GraphResult<T> + Send + Sync;

struct ExecutorInner<T> {
    name: &'static str,
    deps: DepSpec,
    factory: Box<SyncFactory<T>>,
    tags: DataStore,
}

/// A dependency-resolution graph node producing values of type `T`.
///
/// `Executor<T>` is a thin `Arc` handle; cloning it shares identity, it does
/// not build a new descriptor. See [`crate::key::Key`] for the identity
/// mechanics.
pub struct Executor<T> {
    inner: Arc<ExecutorInner<T>>,
}

impl<T> Clone for Executor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Executor<T> {
    /// Identity key for this descriptor, stable across clones.
    pub fn key(&self) -> Key {
        Key::from_identity(
            Arc::as_ptr(&self.inner) as *const () as usize,
            self.inner.name,
        )
    }

    /// The declared dependency shape.
    pub fn deps(&self) -> &DepSpec {
        &self.inner.deps
    }

    /// Debug name, typically the produced type's name.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Reads `tag`'s first-set value on this descriptor's metadata bag,
    /// ignoring its default.
    pub fn tag_find<V: Send + Sync + 'static>(&self, tag: &Tag<V>) -> Option<Arc<V>> {
        self.inner.tags.find(tag)
    }

    /// Reads `tag`'s first-set value on this descriptor's metadata bag,
    /// falling back to its default factory.
    pub fn tag_get<V: Send + Sync + 'static>(&self, tag: &Tag<V>) -> GraphResult<Arc<V>> {
        self.inner.tags.get(tag)
    }

    /// Every value set under `tag` on this descriptor's metadata bag, in
    /// declaration order.
    pub fn tag_some<V: Send + Sync + 'static>(&self, tag: &Tag<V>) -> Vec<Arc<V>> {
        self.inner.tags.some(tag)
    }

    /// Invokes this descriptor's factory after resolving its dependencies
    /// through `host`. Called by `Scope`/`Pod`, not by crate users directly.
    pub(crate) fn invoke(&self, host: &dyn DepResolver, ctl: &Controller) -> GraphResult<T> {
        (self.inner.factory)(host, ctl)
    }

    /// Erases `T`, keeping the same `Arc` identity, and tags the projection
    /// with `variant`.
    fn into_variant_any(self, variant: Variant) -> AnyExecutor
    where
        T: 'static,
    {
        AnyExecutor {
            key: self.key(),
            name: self.inner.name,
            erased: Arc::new(self),
            variant,
        }
    }

    pub(crate) fn into_any(self) -> AnyExecutor {
        self.into_variant_any(Variant::Default)
    }

    /// Projects this descriptor for use as a dependency: the dependent
    /// receives the resolved value, and a reverse edge is recorded so a
    /// later `Scope::update` on this descriptor re-runs the dependent.
    ///
    /// ```rust
    /// use scopegraph::descriptor::{provide, derive};
    /// use scopegraph::scope::Scope;
    ///
    /// let count = provide(|_ctl| 1i32);
    /// let doubled = derive(count.reactive(), |n, _ctl| *n * 2);
    ///
    /// let scope = Scope::builder().build();
    /// assert_eq!(*scope.resolve(&doubled).unwrap(), 2);
    /// scope.update(&count, 10).unwrap();
    /// assert_eq!(*scope.resolve(&doubled).unwrap(), 20);
    /// ```
    pub fn reactive(&self) -> ReactiveDep<T> {
        ReactiveDep { exec: self.clone() }
    }

    /// Projects this descriptor for use as a dependency: the dependent
    /// receives an [`crate::scope::Accessor`] without the source factory
    /// running, until the dependent calls `.resolve()` on it.
    pub fn lazy(&self) -> LazyDep<T> {
        LazyDep { exec: self.clone() }
    }

    /// Projects this descriptor for use as a dependency: the dependent
    /// receives an [`crate::scope::Accessor`], and the source factory is
    /// triggered eagerly before the dependent's factory runs.
    ///
    /// Named `r#static` because `static` is a reserved word.
    pub fn r#static(&self) -> StaticDep<T> {
        StaticDep { exec: self.clone() }
    }
}

/// Marker trait used by `AnyExecutor` to downcast back to a concrete
/// `Executor<T>` during dependency resolution.
trait ErasedExecutor: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + Sync + 'static> ErasedExecutor for Executor<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A type-erased descriptor projection carrying a [`Variant`].
///
/// Produced by `Executor::reactive`/`lazy`/`r#static`, and implicitly by
/// `provide`/`derive` with `Variant::Default`. Shares `Arc` identity with
/// the `Executor<T>` it came from.
#[derive(Clone)]
pub struct AnyExecutor {
    key: Key,
    name: &'static str,
    erased: Arc<dyn ErasedExecutor>,
    variant: Variant,
}

impl AnyExecutor {
    /// Identity key, identical to the originating `Executor<T>::key()`.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Debug name of the produced type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The caching/propagation variant this projection was built with.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Recovers the concrete `Executor<T>` this projection was built from.
    ///
    /// Returns `None` if `T` does not match the descriptor's produced type;
    /// `Scope`'s resolution path always calls this with the correct `T`
    /// because the caller supplied the original typed `Executor<T>`.
    pub(crate) fn downcast<T: Send + Sync + 'static>(&self) -> Option<&Executor<T>> {
        self.erased.as_any().downcast_ref::<Executor<T>>()
    }
}

/// Builds a descriptor with no declared dependencies.
///
/// `factory` receives a [`Controller`] for registering cleanup and is
/// invoked at most once per owning scope (subject to the descriptor's
/// variant).
///
/// # Examples
///
/// ```rust
/// use scopegraph::descriptor::provide;
///
/// let greeting = provide(|_ctl| "hello".to_string());
/// assert_eq!(greeting.name(), "alloc::string::String");
/// ```
pub fn provide<T, F>(factory: F) -> Executor<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Controller) -> T + Send + Sync + 'static,
{
    provide_tagged(factory, |_tags| {})
}

/// Like [`provide`], additionally attaching descriptor metadata through
/// `tags`, a builder callback run once against a fresh [`DataStore`].
///
/// # Examples
///
/// ```rust
/// use scopegraph::descriptor::provide_tagged;
/// use scopegraph::datastore::TagContainer;
/// use scopegraph::tag::{tag, TagOptions};
///
/// let priority = tag::<&'static str>(TagOptions { label: "priority", default: None });
/// let job = provide_tagged(|_ctl| 1i32, |tags| tags.set(&priority, "high"));
/// assert_eq!(*job.tag_get(&priority).unwrap(), "high");
/// ```
pub fn provide_tagged<T, F, G>(factory: F, tags: G) -> Executor<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Controller) -> T + Send + Sync + 'static,
    G: FnOnce(&mut DataStore),
{
    let mut tag_store = DataStore::new();
    tags(&mut tag_store);
    Executor {
        inner: Arc::new(ExecutorInner {
            name: std::any::type_name::<T>(),
            deps: DepSpec::None,
            factory: Box::new(move |_host, ctl| Ok(factory(ctl))),
            tags: tag_store,
        }),
    }
}

/// Builds a descriptor whose factory consumes `deps`, resolved through the
/// owning scope before the factory runs.
///
/// # Examples
///
/// ```rust
/// use scopegraph::descriptor::{provide, derive};
///
/// let base = provide(|_ctl| 10i32);
/// let doubled = derive(base.clone(), |n, _ctl| *n * 2);
/// assert_eq!(doubled.name(), "i32");
/// ```
pub fn derive<T, D, F>(deps: D, factory: F) -> Executor<T>
where
    T: Send + Sync + 'static,
    D: Dependencies,
    F: Fn(D::Output, &Controller) -> T + Send + Sync + 'static,
{
    derive_tagged(deps, factory, |_tags| {})
}

/// Like [`derive`], additionally attaching descriptor metadata through
/// `tags`, a builder callback run once against a fresh [`DataStore`].
pub fn derive_tagged<T, D, F, G>(deps: D, factory: F, tags: G) -> Executor<T>
where
    T: Send + Sync + 'static,
    D: Dependencies,
    F: Fn(D::Output, &Controller) -> T + Send + Sync + 'static,
    G: FnOnce(&mut DataStore),
{
    let spec = deps.spec();
    let mut tag_store = DataStore::new();
    tags(&mut tag_store);
    Executor {
        inner: Arc::new(ExecutorInner {
            name: std::any::type_name::<T>(),
            deps: spec,
            factory: Box::new(move |host, ctl| {
                let resolved = deps.resolve(host)?;
                Ok(factory(resolved, ctl))
            }),
            tags: tag_store,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provide_has_no_deps() {
        let e = provide(|_ctl| 1i32);
        assert!(matches!(e.deps(), DepSpec::None));
    }

    #[test]
    fn derive_captures_single_dep() {
        let base = provide(|_ctl| 1i32);
        let derived = derive(base.clone(), |n, _ctl| n.clone());
        match derived.deps() {
            DepSpec::Single(any) => assert_eq!(any.key(), base.key()),
            _ => panic!("expected Single dep spec"),
        }
    }

    #[test]
    fn variant_projections_share_identity() {
        let base = provide(|_ctl| 1i32);
        assert_eq!(base.reactive().key(), base.key());
        assert_eq!(base.lazy().key(), base.key());
        assert_eq!(base.r#static().key(), base.key());
    }

    #[test]
    fn tags_are_readable_after_construction() {
        use crate::tag::{tag, TagOptions};

        let priority: crate::tag::Tag<&'static str> = tag(TagOptions { label: "priority", default: None });
        let e = provide_tagged(|_ctl| 1i32, |tags| tags.set(&priority, "high"));
        assert_eq!(*e.tag_get(&priority).unwrap(), "high");
    }

    #[test]
    fn reactive_dep_spec_carries_reactive_variant() {
        let base = provide(|_ctl| 1i32);
        let derived = derive(base.reactive(), |n, _ctl| *n);
        match derived.deps() {
            DepSpec::Single(any) => assert_eq!(any.variant(), Variant::Reactive),
            _ => panic!("expected Single dep spec"),
        }
    }
}
