//! # Subscription context.
//!
//! [`Context`] is an immutable key/value chain threaded through `subscribe`
//! as an explicit parameter. A write produces a new head pointing at the
//! previous one; nothing is ever mutated in place, so concurrent
//! subscriptions never observe each other's values.
//!
//! ```text
//! source ── read(K) ─┐                       subscribe(cx = {})
//!                    │
//!  ...write(K=10) ◄──┴── sees {K=10, K=100}   ← innermost write shadows
//!  ...write(K=100)◄───── sees {K=100}
//!  subscriber
//! ```
//!
//! Subscribing walks from the subscriber towards the source; each
//! `context_write` pushes its entry before passing the context upstream.
//! Reads therefore resolve to the write closest to the reader.
//!
//! Keys prefixed by the engine are *reserved*: they carry per-subscription
//! plumbing (dropped-signal hooks, error strategy, virtual clock) and are
//! invisible to `get`, `has_key`, `len` and `keys`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub(crate) mod keys {
    pub(crate) const ON_NEXT_DROPPED: &str = "rivulet.hooks.on_next_dropped";
    pub(crate) const ON_ERROR_DROPPED: &str = "rivulet.hooks.on_error_dropped";
    pub(crate) const ERROR_STRATEGY: &str = "rivulet.error_strategy";
    pub(crate) const VIRTUAL_TIME: &str = "rivulet.virtual_time";
}

struct Entry {
    key: Arc<str>,
    value: Arc<dyn Any + Send + Sync>,
    reserved: bool,
    parent: Option<Arc<Entry>>,
}

/// Immutable, copy-on-write key/value map attached to a subscription.
#[derive(Clone, Default)]
pub struct Context {
    head: Option<Arc<Entry>>,
}

impl Context {
    /// Returns an empty context.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a context holding a single entry.
    pub fn of<V>(key: impl Into<Arc<str>>, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        Self::empty().put(key, value)
    }

    /// Returns a new context with `key` bound to `value`, shadowing any
    /// previous binding.
    ///
    /// ```
    /// use rivulet::Context;
    ///
    /// let base = Context::of("user", "ana".to_string());
    /// let cx = base.put("user", "bob".to_string());
    /// assert_eq!(cx.get::<String>("user").map(String::as_str), Some("bob"));
    /// assert_eq!(base.get::<String>("user").map(String::as_str), Some("ana"));
    /// ```
    #[must_use]
    pub fn put<V>(&self, key: impl Into<Arc<str>>, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        self.push(key.into(), Arc::new(value), false)
    }

    /// Returns a new context with every visible and reserved entry of `other`
    /// layered on top of `self`.
    #[must_use]
    pub fn put_all(&self, other: &Context) -> Self {
        let mut entries: Vec<&Entry> = other.iter_entries().collect();
        entries.reverse();
        entries.into_iter().fold(self.clone(), |cx, e| {
            cx.push(Arc::clone(&e.key), Arc::clone(&e.value), e.reserved)
        })
    }

    /// Returns the value of `key` when it exists and has type `V`.
    ///
    /// A binding of another type shadows older bindings of type `V`.
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.lookup(key, false)?.downcast_ref::<V>()
    }

    /// Returns a clone of the value of `key`, or `default`.
    pub fn get_or<V: Any + Clone>(&self, key: &str, default: V) -> V {
        self.get::<V>(key).cloned().unwrap_or(default)
    }

    /// True if `key` is bound (to any type).
    pub fn has_key(&self, key: &str) -> bool {
        self.lookup(key, false).is_some()
    }

    /// Distinct visible keys, innermost first.
    pub fn keys(&self) -> Vec<Arc<str>> {
        let mut out: Vec<Arc<str>> = Vec::new();
        for e in self.iter_entries().filter(|e| !e.reserved) {
            if !out.iter().any(|k| *k == e.key) {
                out.push(Arc::clone(&e.key));
            }
        }
        out
    }

    /// Number of distinct visible keys.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// True when no visible key is bound.
    pub fn is_empty(&self) -> bool {
        self.iter_entries().all(|e| e.reserved)
    }

    pub(crate) fn put_reserved<V>(&self, key: &'static str, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        self.push(Arc::from(key), Arc::new(value), true)
    }

    pub(crate) fn get_reserved<V: Any>(&self, key: &str) -> Option<&V> {
        self.lookup(key, true)?.downcast_ref::<V>()
    }

    fn push(&self, key: Arc<str>, value: Arc<dyn Any + Send + Sync>, reserved: bool) -> Self {
        Self {
            head: Some(Arc::new(Entry {
                key,
                value,
                reserved,
                parent: self.head.clone(),
            })),
        }
    }

    fn lookup(&self, key: &str, reserved: bool) -> Option<&(dyn Any + Send + Sync)> {
        self.iter_entries()
            .find(|e| e.reserved == reserved && &*e.key == key)
            .map(|e| &*e.value)
    }

    fn iter_entries(&self) -> impl Iterator<Item = &Entry> {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let e = cursor?;
            cursor = e.parent.as_deref();
            Some(e)
        })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_innermost_write_shadows() {
        let outer = Context::of("k", 100_i32);
        let inner = outer.put("k", 10_i32);
        assert_eq!(inner.get::<i32>("k"), Some(&10));
        assert_eq!(outer.get::<i32>("k"), Some(&100));
        assert_eq!(inner.len(), 1);
    }

    #[test]
    fn test_type_mismatch_hides_value() {
        let cx = Context::of("k", 1_u8).put("k", "text");
        assert!(cx.get::<u8>("k").is_none());
        assert!(cx.has_key("k"));
        assert_eq!(cx.get_or("missing", 7_u32), 7);
    }

    #[test]
    fn test_reserved_entries_are_invisible() {
        let cx = Context::empty().put_reserved(keys::VIRTUAL_TIME, 5_u64);
        assert!(cx.is_empty());
        assert!(!cx.has_key(keys::VIRTUAL_TIME));
        assert_eq!(cx.get_reserved::<u64>(keys::VIRTUAL_TIME), Some(&5));
    }

    #[test]
    fn test_put_all_layers_other_on_top() {
        let base = Context::of("a", 1_i32).put("b", 2_i32);
        let other = Context::of("b", 20_i32).put("c", 30_i32);
        let merged = base.put_all(&other);
        assert_eq!(merged.get::<i32>("a"), Some(&1));
        assert_eq!(merged.get::<i32>("b"), Some(&20));
        assert_eq!(merged.get::<i32>("c"), Some(&30));
        assert_eq!(merged.len(), 3);
        assert_eq!(&*merged.keys()[0], "c");
    }
}
