//! Error types for the dependency-resolution runtime.

use std::fmt;
use std::sync::Arc;

use crate::key::Key;

/// Errors raised by `Scope`/`Pod` resolution, update, and disposal paths.
///
/// Every failure mode described by the runtime surfaces as one of these
/// variants: there are no bare strings or `Box<dyn Error>` escapes from
/// `resolve`/`update`/`release`/`dispose`. Flow handlers never see this type
/// directly; a failed dependency resolution inside a flow is converted into
/// a `ko` envelope (see [`crate::flow::result`]).
///
/// # Examples
///
/// ```rust
/// use scopegraph::GraphError;
///
/// let not_found = GraphError::TagNotFound("request_id");
/// let cycle = GraphError::DependencyCycle(vec!["a", "b", "a"]);
///
/// println!("{}", not_found);
/// println!("{}", cycle);
/// ```
#[derive(Debug, Clone)]
pub enum GraphError {
    /// Any operation attempted after `Scope::dispose`/`Pod::dispose_pod`.
    ScopeDisposed,
    /// A factory panicked or returned an error while being invoked.
    FactoryExecution {
        descriptor: &'static str,
        cause: Arc<GraphError>,
    },
    /// A dependency failed to resolve while resolving a dependent descriptor.
    DependencyResolution {
        descriptor: &'static str,
        failing_dependency: &'static str,
        cause: Arc<GraphError>,
    },
    /// A cycle was detected in the dependency graph; carries the full path.
    DependencyCycle(Vec<&'static str>),
    /// A resolved dependency's shape did not match the declared dependency spec.
    DependencyShape {
        expected: &'static str,
        found: &'static str,
    },
    /// Input/success/error schema validation failed.
    Schema {
        issues: Vec<crate::schema::SchemaIssue>,
        path: Option<String>,
    },
    /// A required tag was not present on the queried container.
    TagNotFound(&'static str),
    /// A flow handler panicked. Carries the panic payload formatted as text,
    /// since a caught `Box<dyn Any + Send>` payload is neither `Sync` nor
    /// itself a `GraphError`.
    UncaughtHandler { message: String },
}

impl GraphError {
    /// Wraps `self` as the `cause` of a `FactoryExecution` error for `descriptor`.
    pub fn into_factory_execution(self, descriptor: &'static str) -> GraphError {
        GraphError::FactoryExecution {
            descriptor,
            cause: Arc::new(self),
        }
    }

    /// Wraps `self` as the `cause` of a `DependencyResolution` error.
    pub fn into_dependency_resolution(
        self,
        descriptor: &'static str,
        failing_dependency: &'static str,
    ) -> GraphError {
        GraphError::DependencyResolution {
            descriptor,
            failing_dependency,
            cause: Arc::new(self),
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::ScopeDisposed => write!(f, "scope has been disposed"),
            GraphError::FactoryExecution { descriptor, cause } => {
                write!(f, "factory for {descriptor} failed: {cause}")
            }
            GraphError::DependencyResolution {
                descriptor,
                failing_dependency,
                cause,
            } => write!(
                f,
                "{descriptor} failed to resolve dependency {failing_dependency}: {cause}"
            ),
            GraphError::DependencyCycle(path) => {
                write!(f, "circular dependency: {}", path.join(" -> "))
            }
            GraphError::DependencyShape { expected, found } => {
                write!(f, "dependency shape mismatch: expected {expected}, found {found}")
            }
            GraphError::Schema { issues, path } => {
                write!(f, "schema validation failed")?;
                if let Some(path) = path {
                    write!(f, " at {path}")?;
                }
                for issue in issues {
                    write!(f, "; {issue}")?;
                }
                Ok(())
            }
            GraphError::TagNotFound(key) => write!(f, "tag not found: {key}"),
            GraphError::UncaughtHandler { message } => write!(f, "handler panicked: {message}"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Convenience alias used throughout the crate's resolve/update/dispose paths.
pub type GraphResult<T> = Result<T, GraphError>;

/// Panic payload used by the internal circular-dependency guard.
///
/// Mirrors the descriptor-name path carried by [`GraphError::DependencyCycle`];
/// kept as a distinct type so `catch_unwind` can distinguish it from other
/// panics while unwinding through factory invocations.
#[derive(Debug)]
pub(crate) struct CircularPanic {
    pub(crate) path: Vec<&'static str>,
}

/// Small helper so call sites that only have a [`Key`] can format one for errors.
pub(crate) fn key_name(key: &Key) -> &'static str {
    key.display_name()
}

/// Formats a caught panic payload as a short message. Shared by factory
/// invocation (`scope::resolve_value`) and flow handler invocation
/// (`flow::run_catching`), the two places a user-supplied closure panics
/// across a `catch_unwind` boundary.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}
