//! Delivery Registry - correlates in-flight work to its recovery action
//!
//! One instance per owning component: the publisher keys outstanding
//! publishes by sequence number, the consumer keys pending deliveries by
//! delivery tag. All mutations go through the owner's processing loop; the
//! lock only guards against readers on other tasks.

use parking_lot::Mutex;
use std::collections::BTreeMap;

pub struct DeliveryRegistry<T> {
    entries: Mutex<BTreeMap<u64, T>>,
}

impl<T> DeliveryRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn track(&self, id: u64, entry: T) {
        self.entries.lock().insert(id, entry);
    }

    /// Remove and return an entry once its outcome is known.
    pub fn resolve(&self, id: u64) -> Option<T> {
        self.entries.lock().remove(&id)
    }

    /// Mutate an entry in place; `None` if it already settled.
    pub fn with_entry<R>(&self, id: u64, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.entries.lock().get_mut(&id).map(f)
    }

    /// Keys of everything still tracked, in ascending order. Replay after
    /// reconnect walks this to preserve issue order.
    pub fn outstanding(&self) -> Vec<u64> {
        self.entries.lock().keys().copied().collect()
    }

    pub fn drain(&self) -> Vec<(u64, T)> {
        let mut entries = self.entries.lock();
        std::mem::take(&mut *entries).into_iter().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T> Default for DeliveryRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_resolve_round_trip() {
        let registry = DeliveryRegistry::new();
        registry.track(7, "seven");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(7), Some("seven"));
        assert_eq!(registry.resolve(7), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn outstanding_is_ascending_regardless_of_insert_order() {
        let registry = DeliveryRegistry::new();
        for id in [3u64, 1, 2] {
            registry.track(id, id);
        }
        assert_eq!(registry.outstanding(), vec![1, 2, 3]);
    }

    #[test]
    fn with_entry_mutates_in_place() {
        let registry = DeliveryRegistry::new();
        registry.track(1, 0u32);
        assert_eq!(registry.with_entry(1, |v| {
            *v += 1;
            *v
        }), Some(1));
        assert_eq!(registry.with_entry(99, |v| *v), None);
        assert_eq!(registry.resolve(1), Some(1));
    }

    #[test]
    fn drain_empties_in_key_order() {
        let registry = DeliveryRegistry::new();
        registry.track(2, "b");
        registry.track(1, "a");
        let drained = registry.drain();
        assert_eq!(drained, vec![(1, "a"), (2, "b")]);
        assert!(registry.is_empty());
    }
}
