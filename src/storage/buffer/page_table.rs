//! Extendible hash table mapping resident page ids to frames.
//!
//! The directory holds `2^global_depth` slots, each naming a bucket. A bucket
//! with local depth `d` is shared by every slot whose low `d` hash bits match.
//! A full bucket is split on the next significant bit, doubling the directory
//! first when the bucket already uses every directory bit. Buckets are never
//! merged on removal.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// Upper bound on the directory size (`2^MAX_DEPTH` slots).
const MAX_DEPTH: usize = 20;

#[derive(Debug)]
struct Bucket<K, V> {
    local_depth: usize,
    entries: Vec<(K, V)>,
}

impl<K: Eq, V> Bucket<K, V> {
    fn new(local_depth: usize, capacity: usize) -> Self {
        Self {
            local_depth,
            entries: Vec::with_capacity(capacity),
        }
    }

    fn position(&self, key: &K) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

#[derive(Debug)]
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    global_depth: usize,
    bucket_size: usize,
    /// Directory slot -> index into `buckets`.
    directory: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
    hasher: S,
}

impl<K: Hash + Eq, V: Clone> ExtendibleHashTable<K, V, RandomState> {
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K: Hash + Eq, V: Clone, S: BuildHasher> ExtendibleHashTable<K, V, S> {
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        let bucket_size = bucket_size.max(1);
        Self {
            global_depth: 0,
            bucket_size,
            directory: vec![0],
            buckets: vec![Bucket::new(0, bucket_size)],
            hasher,
        }
    }

    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn slot_of(&self, hash: u64) -> usize {
        (hash & ((1u64 << self.global_depth) - 1)) as usize
    }

    fn bucket_index(&self, key: &K) -> usize {
        self.directory[self.slot_of(self.hash(key))]
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let bucket = &self.buckets[self.bucket_index(key)];
        bucket
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Inserts or replaces the value stored under `key`.
    pub fn insert(&mut self, key: K, value: V) {
        let hash = self.hash(&key);

        loop {
            let index = self.directory[self.slot_of(hash)];
            let bucket = &mut self.buckets[index];

            if let Some(pos) = bucket.position(&key) {
                bucket.entries[pos].1 = value;
                return;
            }

            // Keys that agree on every addressable bit can only live together,
            // so a bucket at the depth limit is allowed to overflow.
            if bucket.entries.len() < self.bucket_size || bucket.local_depth == MAX_DEPTH {
                bucket.entries.push((key, value));
                return;
            }

            self.split(index);
        }
    }

    fn split(&mut self, index: usize) {
        let local_depth = self.buckets[index].local_depth;

        if local_depth == self.global_depth {
            // Slot i + 2^d points where slot i already does
            self.directory.extend_from_within(..);
            self.global_depth += 1;
        }

        let high_bit = 1u64 << local_depth;
        let entries = std::mem::take(&mut self.buckets[index].entries);
        let (moved, kept): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|(k, _)| self.hasher.hash_one(k) & high_bit != 0);

        self.buckets[index].local_depth = local_depth + 1;
        self.buckets[index].entries = kept;

        let sibling = self.buckets.len();
        self.buckets.push(Bucket {
            local_depth: local_depth + 1,
            entries: moved,
        });

        for (slot, target) in self.directory.iter_mut().enumerate() {
            if *target == index && (slot as u64) & high_bit != 0 {
                *target = sibling;
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.bucket_index(key);
        let bucket = &mut self.buckets[index];
        let pos = bucket.position(key)?;
        Some(bucket.entries.swap_remove(pos).1)
    }

    pub fn global_depth(&self) -> usize {
        self.global_depth
    }

    /// Local depth of the bucket behind directory slot `slot`.
    pub fn local_depth(&self, slot: usize) -> Option<usize> {
        self.directory
            .get(slot)
            .map(|&index| self.buckets[index].local_depth)
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
