//! Consistent Hash Ring
//!
//! Maps keys to shard indices through virtual nodes so that adding or
//! removing a shard only moves the keys in the affected ring regions.

use std::collections::{BTreeMap, BTreeSet};

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{CacheError, Result};

/// A key whose owning shard changes after a ring update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMove {
    pub key: String,
    pub from: usize,
    pub to: usize,
}

// == Consistent Hash Ring ==
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    /// Virtual node position -> shard index
    ring: BTreeMap<u64, usize>,
    /// Shards currently on the ring
    shards: BTreeSet<usize>,
    virtual_nodes: usize,
}

impl ConsistentHashRing {
    /// Creates a ring holding shards `0..shard_count`.
    pub fn new(shard_count: usize, virtual_nodes: usize) -> Self {
        let mut ring = Self {
            ring: BTreeMap::new(),
            shards: BTreeSet::new(),
            virtual_nodes: virtual_nodes.max(1),
        };
        for shard in 0..shard_count {
            ring.insert_shard(shard);
        }
        ring
    }

    /// Number of shards on the ring.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of virtual node positions.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    // == Assign ==
    /// Returns the shard owning `key`: the first virtual node clockwise
    /// from the key's hash, wrapping around.
    pub fn assign(&self, key: &str) -> Result<usize> {
        let hash = xxh3_64(key.as_bytes());
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, shard)| *shard)
            .ok_or(CacheError::NoShardsAvailable)
    }

    // == Add Shard ==
    /// Adds the next shard index and returns it together with the keys,
    /// out of `keys`, that now belong to it.
    pub fn add_shard<'a, I>(&mut self, keys: I) -> (usize, Vec<KeyMove>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let shard = self.shards.iter().next_back().map_or(0, |s| s + 1);
        let before = self.clone();
        self.insert_shard(shard);
        (shard, self.moves_since(&before, keys))
    }

    // == Remove Shard ==
    /// Removes `shard` and returns the keys, out of `keys`, that must leave it.
    ///
    /// Removing the final shard is allowed; every later lookup then fails
    /// with `NoShardsAvailable`, and the returned moves are empty because
    /// there is nowhere to move to.
    pub fn remove_shard<'a, I>(&mut self, shard: usize, keys: I) -> Result<Vec<KeyMove>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        if !self.shards.contains(&shard) {
            return Err(CacheError::InvalidConfig(format!(
                "shard {shard} is not on the ring"
            )));
        }
        let before = self.clone();
        self.shards.remove(&shard);
        self.ring.retain(|_, owner| *owner != shard);
        if self.ring.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.moves_since(&before, keys))
    }

    fn insert_shard(&mut self, shard: usize) {
        self.shards.insert(shard);
        for vnode in 0..self.virtual_nodes {
            let position = xxh3_64(format!("shard-{shard}-vnode-{vnode}").as_bytes());
            self.ring.insert(position, shard);
        }
    }

    fn moves_since<'a, I>(&self, before: &ConsistentHashRing, keys: I) -> Vec<KeyMove>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter()
            .filter_map(|key| {
                let from = before.assign(key).ok()?;
                let to = self.assign(key).ok()?;
                (from != to).then(|| KeyMove {
                    key: key.to_string(),
                    from,
                    to,
                })
            })
            .collect()
    }
}
