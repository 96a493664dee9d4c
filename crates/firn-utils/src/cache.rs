//! A bounded LRU cache that notifies values on displacement.

use std::collections::HashMap;
use std::hash::Hash;

/// Implemented by cached values that need to observe their own eviction,
/// e.g. to drop references that would otherwise pin memory.
pub trait Evictable {
    fn evict(&self);
}

/// A bounded least-recently-used cache.
///
/// Every `get`/`put` refreshes the entry's recency. When an insert pushes
/// the cache past its capacity, the stalest entry is displaced and its
/// [`Evictable::evict`] hook runs before the value is dropped.
pub struct LruCache<K: Eq + Hash + Clone, V: Evictable> {
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
    tick: u64,
}

struct Entry<V> {
    value: V,
    last_used: u64,
}

impl<K: Eq + Hash + Clone, V: Evictable> LruCache<K, V> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            tick: 0,
        }
    }

    /// Looks up `key`, refreshing its recency on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(&entry.value)
    }

    /// Inserts or replaces `key`. A replaced value and any displaced entry
    /// are notified through their evict hook.
    pub fn put(&mut self, key: K, value: V) {
        self.tick += 1;
        if let Some(old) = self.entries.insert(
            key,
            Entry {
                value,
                last_used: self.tick,
            },
        ) {
            old.value.evict();
        }
        if self.entries.len() > self.capacity {
            self.displace_stalest();
        }
    }

    /// Removes `key` without running the evict hook; the caller keeps full
    /// ownership of the returned value.
    pub fn take(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Evicts every entry, notifying each.
    pub fn flush(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.value.evict();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn displace_stalest(&mut self) {
        let stalest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = stalest {
            if let Some(entry) = self.entries.remove(&key) {
                entry.value.evict();
            }
        }
    }
}
