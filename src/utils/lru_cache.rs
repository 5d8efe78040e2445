//! Small bounded LRU cache used for the Analyzer's in-process schema-context
//! and oracle-response caches (§5: "bounded, LRU, default 1024 entries").
//! Grounded on the hand-rolled `HashMap` + access-order `Vec` eviction in
//! `profile_analyzer/analyzer/query_history.rs`'s `ExecutionBaseline` cache,
//! generalized into a standalone keyed cache instead of a regression-specific
//! one.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

pub struct LruCache<K, V> {
    capacity: usize,
    entries: RwLock<HashMap<K, V>>,
    order: RwLock<Vec<K>>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: RwLock::new(HashMap::new()), order: RwLock::new(Vec::new()) }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.entries.read().unwrap().get(key).cloned();
        if value.is_some() {
            let mut order = self.order.write().unwrap();
            order.retain(|k| k != key);
            order.push(key.clone());
        }
        value
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().unwrap();
        let mut order = self.order.write().unwrap();

        order.retain(|k| k != &key);
        order.push(key.clone());

        if !entries.contains_key(&key) && entries.len() >= self.capacity
            && let Some(oldest) = order.first().cloned()
        {
            entries.remove(&oldest);
            order.remove(0);
        }
        entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache: LruCache<i32, &str> = LruCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        assert_eq!(cache.get(&1), Some("a"));
        cache.insert(3, "c");
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&3), Some("c"));
    }
}
