//! Slab-backed registry for reactor handlers.
//!
//! Timers and I/O handlers live in registries keyed by a stable slot id.
//! A slot's callback is taken out while it runs, so the callback itself can
//! get `&mut Reactor` and freely arm, cancel or remove handlers, its own
//! included.

use slab::Slab;

/// Registry of handlers with an optional upper bound.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct HandlerRegistry<T> {
    slots: Slab<T>,
    max_handlers: usize,
}

impl<T> HandlerRegistry<T> {
    /// Create a registry holding at most `max_handlers` entries.
    pub fn new(max_handlers: usize) -> Self {
        Self {
            slots: Slab::with_capacity(max_handlers.min(1024)),
            max_handlers,
        }
    }

    /// Insert a new handler.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, handler: T) -> Option<usize> {
        if self.slots.len() >= self.max_handlers {
            return None;
        }
        Some(self.slots.insert(handler))
    }

    pub fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<T> {
        self.slots.try_remove(id)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Remove every handler, yielding them in slot order.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_capacity_and_reuse() {
        let mut registry = HandlerRegistry::new(2);

        let a = registry.insert("a").unwrap();
        let b = registry.insert("b").unwrap();
        assert!(registry.insert("c").is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(b), Some(&"b"));

        assert_eq!(registry.remove(a), Some("a"));
        assert!(registry.get(a).is_none());
        assert_eq!(registry.remove(a), None);

        // Slab reuses the freed slot.
        assert_eq!(registry.insert("d"), Some(a));
        assert_eq!(registry.drain().count(), 2);
        assert_eq!(registry.len(), 0);
    }
}
