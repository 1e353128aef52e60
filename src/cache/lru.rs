//! LRU Selection Module
//!
//! Picks least recently used entries for eviction and migration.

use std::collections::{BinaryHeap, HashMap};

use crate::cache::CacheEntry;

// == LRU Victims ==
/// Returns up to `count` keys ordered from least to most recently used.
///
/// Keeps a bounded max-heap of `(last_access, key)` so selecting a few
/// victims from a large shard costs O(n log count) rather than a full sort.
pub fn lru_victims(entries: &HashMap<String, CacheEntry>, count: usize) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }

    let mut heap: BinaryHeap<(u64, &str)> = BinaryHeap::with_capacity(count + 1);
    for (key, entry) in entries {
        let candidate = (entry.last_access(), key.as_str());
        if heap.len() < count {
            heap.push(candidate);
        } else if heap.peek().is_some_and(|top| candidate < *top) {
            heap.pop();
            heap.push(candidate);
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|(_, key)| key.to_string())
        .collect()
}
