//! Sharded index map
//!
//! Concurrent map behind per-shard locks, keyed by the encoded derivative
//! key. The shard count is a power of two so the hash can be masked instead
//! of taken modulo.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use super::SHARD_COUNT;

/// Concurrent string-keyed map with `SHARD_COUNT`-way sharding.
pub struct ShardedMap<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ShardedMap<V> {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (SHARD_COUNT - 1)]
    }

    /// Run a closure against the stored value without cloning it.
    pub fn inspect<T>(&self, key: &str, f: impl FnOnce(&V) -> T) -> Option<T> {
        let guard = self.shard(key).read();
        guard.get(key).map(f)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Insert a value, returning any value it replaced.
    pub fn insert(&self, key: String, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    /// Remove every entry whose key matches the predicate.
    pub fn remove_matching(&self, mut pred: impl FnMut(&str) -> bool) -> Vec<(String, V)> {
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut guard = shard.write();
            let keys: Vec<String> = guard
                .keys()
                .filter(|k| pred(k.as_str()))
                .cloned()
                .collect();
            for key in keys {
                if let Some(value) = guard.remove(&key) {
                    removed.push((key, value));
                }
            }
        }
        removed
    }

    /// Map every entry through a closure into a flat snapshot.
    pub fn snapshot<T>(&self, mut f: impl FnMut(&str, &V) -> T) -> Vec<T> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            for (key, value) in guard.iter() {
                out.push(f(key, value));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_inspect_remove() {
        let map: ShardedMap<u32> = ShardedMap::new();
        assert!(map.insert("a".into(), 1).is_none());
        assert_eq!(map.insert("a".into(), 2), Some(1));
        assert_eq!(map.inspect("a", |v| *v), Some(2));
        assert_eq!(map.remove("a"), Some(2));
        assert!(map.is_empty());
    }

    #[test]
    fn test_remove_matching() {
        let map: ShardedMap<u32> = ShardedMap::new();
        for i in 0..20 {
            map.insert(format!("a/{i}"), i);
        }
        for i in 0..5 {
            map.insert(format!("b/{i}"), i);
        }
        let removed = map.remove_matching(|k| k.starts_with("a/"));
        assert_eq!(removed.len(), 20);
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn test_snapshot_sees_all_shards() {
        let map: ShardedMap<u64> = ShardedMap::new();
        for i in 0..500u64 {
            map.insert(format!("key-{i}"), i);
        }
        let mut sizes = map.snapshot(|_, v| *v);
        sizes.sort_unstable();
        assert_eq!(sizes.len(), 500);
        assert_eq!(sizes[0], 0);
        assert_eq!(sizes[499], 499);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<usize>> = Arc::new(ShardedMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..500 {
                        map.insert(format!("k-{t}-{i}"), i);
                        map.inspect(&format!("k-{t}-{i}"), |v| *v);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 4000);
    }
}
