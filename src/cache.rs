//! Per-thread LRU caches over graph lookups.
//!
//! Each worker thread owns one [`CacheSet`]; the set is passed explicitly
//! into the operations that consult it. Caches are never shared between
//! threads. Resizing a cache discards its contents.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use crate::index::graph::Handle;
use crate::model::NodeId;

/// A bounded map evicting the least recently used entry on overflow.
pub struct LruCache<K: Eq + Hash + Clone, V: Clone> {
    capacity: usize,
    map: HashMap<K, V>,
    // access order, oldest first; may contain stale duplicates
    queue: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        LruCache {
            capacity: capacity.max(1),
            map: HashMap::with_capacity(capacity.max(1)),
            queue: VecDeque::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(v) = self.map.get(key) {
            let v = v.clone();
            self.queue.push_back(key.clone());
            self.compact();
            Some(v)
        } else {
            None
        }
    }

    pub fn put(&mut self, key: K, value: V) {
        self.map.insert(key.clone(), value);
        self.queue.push_back(key);
        while self.map.len() > self.capacity {
            match self.queue.pop_front() {
                Some(old) => {
                    // only evict if this was the final reference in the queue
                    if !self.queue.contains(&old) {
                        self.map.remove(&old);
                    }
                }
                None => break,
            }
        }
        self.compact();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.queue.clear();
    }

    // keep the access queue from growing without bound
    fn compact(&mut self) {
        if self.queue.len() > self.capacity.saturating_mul(4) {
            let mut seen = HashMap::with_capacity(self.map.len());
            let mut fresh = VecDeque::with_capacity(self.map.len());
            for key in self.queue.iter().rev() {
                if self.map.contains_key(key) && !seen.contains_key(key) {
                    seen.insert(key.clone(), ());
                    fresh.push_front(key.clone());
                }
            }
            self.queue = fresh;
        }
    }
}

/// The four caches a worker thread carries through a mapping task:
/// node sequences, node linear starts, node occurrences in reference paths,
/// and node edge lists. All share one configured capacity.
pub struct CacheSet {
    pub node: LruCache<NodeId, String>,
    pub node_start: LruCache<NodeId, i64>,
    pub node_paths: LruCache<(NodeId, bool), HashMap<String, Vec<usize>>>,
    pub edges: LruCache<NodeId, Vec<(Handle, Handle)>>,
}

impl CacheSet {
    pub fn new(capacity: usize) -> Self {
        CacheSet {
            node: LruCache::new(capacity),
            node_start: LruCache::new(capacity),
            node_paths: LruCache::new(capacity),
            edges: LruCache::new(capacity),
        }
    }
}

impl Default for CacheSet {
    fn default() -> Self {
        CacheSet::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache: LruCache<i64, String> = LruCache::new(2);
        cache.put(1, "a".into());
        cache.put(2, "b".into());
        assert_eq!(cache.get(&1), Some("a".into()));
        cache.put(3, "c".into());
        // 2 was the least recently touched entry
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("a".into()));
        assert_eq!(cache.get(&3), Some("c".into()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn repeated_touches_do_not_grow() {
        let mut cache: LruCache<i64, i64> = LruCache::new(4);
        for i in 0..4 {
            cache.put(i, i);
        }
        for _ in 0..100 {
            cache.get(&0);
            cache.get(&3);
        }
        cache.put(10, 10);
        assert_eq!(cache.len(), 4);
        assert!(cache.get(&0).is_some());
        assert!(cache.get(&3).is_some());
    }
}
