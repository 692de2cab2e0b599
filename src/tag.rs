//! Typed tags: identity-keyed descriptors for out-of-band data carried on
//! scopes, pods, and flow contexts.
//!
//! A `Tag<T>` is an `Arc`-backed identity handle carrying its own default
//! value factory, so a lookup through `TagContainer::get` never needs a
//! separate discovery registry to fall back on.

use std::sync::Arc;

use crate::key::Key;

/// Construction options for [`tag`].
pub struct TagOptions<T> {
    /// Debug label surfaced in `GraphError::TagNotFound` and diagnostics.
    pub label: &'static str,
    /// Optional default value factory used by `TagContainer::get` when the
    /// tag has not been set.
    pub default: Option<Arc<dyn Fn() -> T + Send + Sync>>,
}

impl<T> Default for TagOptions<T> {
    fn default() -> Self {
        Self {
            label: "",
            default: None,
        }
    }
}

struct TagInner<T> {
    label: &'static str,
    default: Option<Arc<dyn Fn() -> T + Send + Sync>>,
}

/// A typed, identity-keyed tag usable with any [`crate::datastore::TagContainer`].
///
/// # Examples
///
/// ```rust
/// use scopegraph::datastore::{DataStore, TagContainer};
/// use scopegraph::tag::{tag, TagOptions};
///
/// let request_id = tag::<String>(TagOptions {
///     label: "request_id",
///     default: None,
/// });
///
/// let mut store = DataStore::new();
/// assert!(store.some(&request_id).is_empty());
///
/// store.set(&request_id, "abc-123".to_string());
/// assert_eq!(*store.get(&request_id).unwrap(), "abc-123");
/// ```
pub struct Tag<T> {
    inner: Arc<TagInner<T>>,
}

impl<T> Clone for Tag<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Tag<T> {
    /// Identity key for this tag, stable across clones.
    pub fn key(&self) -> Key {
        Key::from_identity(
            Arc::as_ptr(&self.inner) as *const () as usize,
            self.inner.label,
        )
    }

    /// Debug label this tag was constructed with.
    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    /// Computes the default value, if one was configured.
    pub(crate) fn default_value(&self) -> Option<T> {
        self.inner.default.as_ref().map(|f| f())
    }
}

/// Builds a new tag with the given label and optional default factory.
pub fn tag<T: Send + Sync + 'static>(options: TagOptions<T>) -> Tag<T> {
    Tag {
        inner: Arc::new(TagInner {
            label: options.label,
            default: options.default,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_tags_have_distinct_identity() {
        let a = tag::<i32>(TagOptions {
            label: "a",
            default: None,
        });
        let b = tag::<i32>(TagOptions {
            label: "a",
            default: None,
        });
        assert_ne!(a.key(), b.key(), "same label is not the same identity");
        assert_eq!(a.key(), a.clone().key());
    }
}
