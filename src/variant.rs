//! Resolution variants controlling caching and propagation behavior.

/// Controls how a descriptor is cached and how updates propagate through it.
///
/// Variants are not separate descriptors: `AnyExecutor::reactive()`,
/// `.lazy()`, and `.r#static()` all return a projection over the same
/// underlying `Executor<T>` identity, tagged with a different `Variant`.
/// Resolving through two different variant projections of the same
/// descriptor still shares one cache entry in the owning `Scope`; the
/// variant only changes caching/propagation policy, not identity.
///
/// # Variant Characteristics
///
/// - **Default**: resolved once per scope and cached. No reverse edge is
///   recorded, so an upstream `Scope::update` never invalidates it; it keeps
///   its stale cached value until released and resolved again.
/// - **Reactive**: resolved once per scope and cached, but a reverse edge is
///   recorded from the dependency to the dependent, so an upstream
///   `Scope::update` re-runs the dependent and notifies its subscribers.
/// - **Lazy**: resolved once per scope on first access, never
///   automatically invalidated by upstream updates.
/// - **Static**: resolved once per scope and permanently pinned; later
///   `Scope::update` calls targeting this descriptor are rejected.
///
/// # Examples
///
/// ```rust
/// use scopegraph::descriptor::provide;
///
/// let count = provide(|_ctl| 0);
/// let reactive_count = count.reactive();
/// let lazy_count = count.lazy();
///
/// assert_eq!(reactive_count.key(), lazy_count.key());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Cached; no reverse edge recorded, so an upstream update never
    /// invalidates it.
    ///
    /// Most descriptors use this variant implicitly; it's what `provide`
    /// and `derive` return before any variant projection is applied.
    Default,
    /// Cached, with a reverse edge recorded so an upstream update re-runs
    /// the dependent and notifies its subscribers.
    Reactive,
    /// Cached on first access, never invalidated by upstream updates.
    Lazy,
    /// Cached permanently; `Scope::update` on this descriptor is rejected.
    Static,
}
