//! Sharded memoization cache.
//!
//! A fixed-shard concurrent map from string keys to ordered string lists,
//! used to memoize derived SQL fragments (placeholder groups, prefixed table
//! names). Keys hash to a shard with FNV-1a, so contention on one shard never
//! blocks the other fifteen. There is no eviction: the key space is bounded
//! and entries live until `clear()`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of independent shards. A key always hashes to the same shard.
pub const SHARD_COUNT: usize = 16;

const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

#[derive(Default)]
struct Shard {
    entries: RwLock<HashMap<String, Vec<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Hit/miss counters for a single shard.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ShardStats {
    pub hits: u64,
    pub misses: u64,
}

/// Per-shard cache statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub shards: Vec<ShardStats>,
}

impl CacheStats {
    pub fn total_hits(&self) -> u64 {
        self.shards.iter().map(|s| s.hits).sum()
    }

    pub fn total_misses(&self) -> u64 {
        self.shards.iter().map(|s| s.misses).sum()
    }
}

pub struct ShardedCache {
    shards: [Shard; SHARD_COUNT],
}

impl ShardedCache {
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| Shard::default()),
        }
    }

    fn shard(&self, key: &str) -> &Shard {
        let mut hash = FNV_OFFSET_BASIS;
        for b in key.as_bytes() {
            hash ^= u32::from(*b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        &self.shards[hash as usize % SHARD_COUNT]
    }

    /// Look up a key, counting the access as a hit or miss on its shard.
    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        let shard = self.shard(key);
        let found = match shard.entries.read() {
            Ok(entries) => entries.get(key).cloned(),
            // Poisoned shard behaves as empty rather than taking the
            // data path down with it.
            Err(_) => None,
        };
        match found {
            Some(value) => {
                shard.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                shard.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value under a key, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: Vec<String>) {
        let key = key.into();
        let shard = self.shard(&key);
        if let Ok(mut entries) = shard.entries.write() {
            entries.insert(key, value);
        }
    }

    /// Reset every shard's map and counters.
    pub fn clear(&self) {
        for shard in &self.shards {
            if let Ok(mut entries) = shard.entries.write() {
                entries.clear();
            }
            shard.hits.store(0, Ordering::Relaxed);
            shard.misses.store(0, Ordering::Relaxed);
        }
    }

    /// Per-shard hit/miss counts.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            shards: self
                .shards
                .iter()
                .map(|shard| ShardStats {
                    hits: shard.hits.load(Ordering::Relaxed),
                    misses: shard.misses.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

impl Default for ShardedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShardedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ShardedCache")
            .field("shards", &SHARD_COUNT)
            .field("hits", &stats.total_hits())
            .field("misses", &stats.total_misses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let cache = ShardedCache::new();
        cache.set("k1", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            cache.get("k1"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_miss_then_hit_counters() {
        let cache = ShardedCache::new();
        assert!(cache.get("absent").is_none());
        let stats = cache.stats();
        assert_eq!(stats.total_misses(), 1);
        assert_eq!(stats.total_hits(), 0);

        cache.set("absent", vec!["v".to_string()]);
        assert!(cache.get("absent").is_some());
        let stats = cache.stats();
        assert_eq!(stats.total_misses(), 1);
        assert_eq!(stats.total_hits(), 1);
    }

    #[test]
    fn test_clear_resets_entries_and_counters() {
        let cache = ShardedCache::new();
        cache.set("k", vec!["v".to_string()]);
        cache.get("k");
        cache.get("missing");
        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.total_hits(), 0);
        assert_eq!(stats.total_misses(), 0);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_same_key_same_shard() {
        let cache = ShardedCache::new();
        // Same key must land on the same shard, so the second set replaces
        // the first instead of duplicating it elsewhere.
        cache.set("stable", vec!["one".to_string()]);
        cache.set("stable", vec!["two".to_string()]);
        assert_eq!(cache.get("stable"), Some(vec!["two".to_string()]));
    }

    #[test]
    fn test_concurrent_access() {
        let cache = std::sync::Arc::new(ShardedCache::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = std::sync::Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("key_{}_{}", t, i);
                    cache.set(key.clone(), vec![i.to_string()]);
                    assert_eq!(cache.get(&key), Some(vec![i.to_string()]));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.stats().total_hits(), 800);
    }
}
