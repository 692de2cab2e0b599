//! Insertion-ordered key/value storage shared by scope tag bags, pod preset
//! bags, and flow execution contexts.
//!
//! A small `Vec` kept in insertion order, indexed by a side `HashMap` for
//! O(1) lookup: small collections stay cache-friendly, and the index only
//! pays for itself once the collection grows. One key can carry more than
//! one value, since `set` appends rather than replacing, and `some` returns
//! every occurrence in insertion order.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GraphError, GraphResult};
use crate::key::Key;
use crate::tag::Tag;

type Slot = Box<dyn Any + Send + Sync>;

/// An insertion-ordered multimap from identity [`Key`]s to type-erased
/// values. A key may carry more than one value, appended in call order.
///
/// Backs `Scope`'s tag bag, `Pod`'s preset/context bag, and `FlowContext`'s
/// `set`/`get` storage identically, so all three share one storage shape.
#[derive(Default)]
pub struct DataStore {
    keys: Vec<Key>,
    values: HashMap<Key, Vec<Slot>>,
}

impl DataStore {
    /// Builds an empty store.
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: HashMap::new(),
        }
    }

    /// Number of distinct keys currently stored.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Appends `value` under `key`, preserving every earlier value set under
    /// the same key.
    pub fn insert<T: Send + Sync + 'static>(&mut self, key: Key, value: T) {
        if !self.values.contains_key(&key) {
            self.keys.push(key);
        }
        self.values.entry(key).or_default().push(Box::new(value));
    }

    /// Reads the first value set under `key`, if any.
    pub fn get<T: Send + Sync + 'static>(&self, key: Key) -> Option<&T> {
        self.values.get(&key)?.first()?.downcast_ref::<T>()
    }

    /// Reads every value set under `key`, in insertion order.
    pub fn get_all<T: Send + Sync + 'static>(&self, key: Key) -> Vec<&T> {
        self.values
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|slot| slot.downcast_ref::<T>())
            .collect()
    }

    /// Whether `key` is present, regardless of type.
    pub fn contains(&self, key: Key) -> bool {
        self.values.get(&key).is_some_and(|v| !v.is_empty())
    }

    /// Removes every value stored under `key`.
    pub fn remove_all(&mut self, key: Key) {
        self.values.remove(&key);
        self.keys.retain(|k| *k != key);
    }

    /// Iterates keys in first-insertion order alongside every value
    /// currently stored under them.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &[Slot])> {
        self.keys
            .iter()
            .map(move |k| (*k, self.values.get(k).map(Vec::as_slice).unwrap_or(&[])))
    }
}

/// Common find/get/some/set/preset surface shared by every [`DataStore`]-backed
/// container (scope tag bags, pod preset bags, flow contexts).
pub trait TagContainer {
    /// Looks up `tag`'s first-set value, returning `None` if absent (default
    /// not applied).
    fn find<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<Arc<T>>;

    /// Looks up `tag`'s first-set value, falling back to its default
    /// factory, erroring with `GraphError::TagNotFound` if neither is
    /// available.
    fn get<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> GraphResult<Arc<T>>;

    /// Every value set under `tag`, in insertion order.
    fn some<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Vec<Arc<T>>;

    /// Appends `value` under `tag`, without replacing earlier values.
    fn set<T: Send + Sync + 'static>(&mut self, tag: &Tag<T>, value: T);

    /// Alias for `set`, used when building a pod's preset overlay, to read
    /// at call sites as "preset this tag for the pod" rather than "mutate".
    fn preset<T: Send + Sync + 'static>(&mut self, tag: &Tag<T>, value: T) {
        self.set(tag, value);
    }
}

impl TagContainer for DataStore {
    fn find<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Option<Arc<T>> {
        self.get::<Arc<T>>(tag.key()).cloned()
    }

    fn get<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> GraphResult<Arc<T>> {
        if let Some(value) = self.find(tag) {
            return Ok(value);
        }
        tag.default_value()
            .map(Arc::new)
            .ok_or(GraphError::TagNotFound(tag.label()))
    }

    fn some<T: Send + Sync + 'static>(&self, tag: &Tag<T>) -> Vec<Arc<T>> {
        self.get_all::<Arc<T>>(tag.key()).into_iter().cloned().collect()
    }

    fn set<T: Send + Sync + 'static>(&mut self, tag: &Tag<T>, value: T) {
        self.insert(tag.key(), Arc::new(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::tag;

    #[test]
    fn preserves_insertion_order_across_keys() {
        let a = tag::<i32>(Default::default());
        let b = tag::<i32>(Default::default());
        let mut store = DataStore::new();
        store.set(&a, 1);
        store.set(&b, 2);
        store.set(&a, 10);

        let keys: Vec<Key> = store.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![a.key(), b.key()]);
    }

    #[test]
    fn set_appends_find_returns_first() {
        let a = tag::<i32>(Default::default());
        let mut store = DataStore::new();
        store.set(&a, 1);
        store.set(&a, 2);

        assert_eq!(*store.find(&a).unwrap(), 1);
        assert_eq!(store.some(&a).iter().map(|v| **v).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn get_falls_back_to_default() {
        let with_default = tag::<i32>(crate::tag::TagOptions {
            label: "n",
            default: Some(Arc::new(|| 7)),
        });
        let store = DataStore::new();
        assert_eq!(*store.get(&with_default).unwrap(), 7);
    }

    #[test]
    fn get_without_default_errors() {
        let no_default = tag::<i32>(Default::default());
        let store = DataStore::new();
        assert!(store.get(&no_default).is_err());
    }
}
