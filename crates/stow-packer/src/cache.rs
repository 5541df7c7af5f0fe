//! In-memory bucket cache with longest-prefix lookup.
//!
//! Buckets are indexed by cache-key (storage key without separators). Since
//! every cache-key is a hex prefix of the digests it owns, the deepest
//! cached bucket on an item's route is the longest cached prefix of the
//! item's hex digest.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bucket::Bucket;

/// Shared handle to a cached bucket.
///
/// Replacing a cached bucket swaps the record inside the existing handle,
/// so every holder observes the new state.
#[derive(Debug)]
pub struct BucketHandle {
    bucket: RwLock<Bucket>,
}

impl BucketHandle {
    pub fn new(bucket: Bucket) -> Self {
        Self {
            bucket: RwLock::new(bucket),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Bucket> {
        self.bucket.read().expect("bucket lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Bucket> {
        self.bucket.write().expect("bucket lock poisoned")
    }

    pub fn snapshot(&self) -> Bucket {
        self.read().clone()
    }
}

#[derive(Debug, Clone)]
struct TrieNode<V> {
    value: Option<V>,
    /// Children sorted by byte.
    children: Vec<(u8, u32)>,
}

/// Byte-level prefix trie over a flat node vector.
///
/// Removal clears a node's value but keeps the node; the cache is bounded
/// by the number of buckets, which only grows.
#[derive(Debug, Clone)]
pub struct PrefixTrie<V> {
    nodes: Vec<TrieNode<V>>,
    len: usize,
}

impl<V> PrefixTrie<V> {
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode {
                value: None,
                children: Vec::new(),
            }],
            len: 0,
        }
    }

    fn find(&self, key: &str) -> Option<usize> {
        let mut node_idx: u32 = 0;
        for &byte in key.as_bytes() {
            let children = &self.nodes[node_idx as usize].children;
            let pos = children.binary_search_by_key(&byte, |&(b, _)| b).ok()?;
            node_idx = children[pos].1;
        }
        Some(node_idx as usize)
    }

    /// Insert `value` at `key`, returning the previous value.
    pub fn insert(&mut self, key: &str, value: V) -> Option<V> {
        let mut node_idx: u32 = 0;
        for &byte in key.as_bytes() {
            let children = &self.nodes[node_idx as usize].children;
            node_idx = match children.binary_search_by_key(&byte, |&(b, _)| b) {
                Ok(pos) => children[pos].1,
                Err(pos) => {
                    let new_idx = self.nodes.len() as u32;
                    self.nodes.push(TrieNode {
                        value: None,
                        children: Vec::new(),
                    });
                    self.nodes[node_idx as usize]
                        .children
                        .insert(pos, (byte, new_idx));
                    new_idx
                }
            };
        }
        let previous = self.nodes[node_idx as usize].value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.find(key).and_then(|idx| self.nodes[idx].value.as_ref())
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let idx = self.find(key)?;
        let previous = self.nodes[idx].value.take();
        if previous.is_some() {
            self.len -= 1;
        }
        previous
    }

    /// The value at the longest key that is a prefix of `s`, with that
    /// key's length.
    pub fn longest_match(&self, s: &str) -> Option<(&V, usize)> {
        let mut node_idx: u32 = 0;
        let mut best = self.nodes[0].value.as_ref().map(|v| (v, 0));
        for (i, &byte) in s.as_bytes().iter().enumerate() {
            let children = &self.nodes[node_idx as usize].children;
            match children.binary_search_by_key(&byte, |&(b, _)| b) {
                Ok(pos) => {
                    node_idx = children[pos].1;
                    if let Some(value) = &self.nodes[node_idx as usize].value {
                        best = Some((value, i + 1));
                    }
                }
                Err(_) => break,
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl<V> Default for PrefixTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix-indexed cache of bucket handles.
///
/// The cache lock is only held for in-memory updates, never across I/O.
#[derive(Debug, Default)]
pub struct BucketCache {
    trie: RwLock<PrefixTrie<Arc<BucketHandle>>>,
}

impl BucketCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cache_key: &str) -> Option<Arc<BucketHandle>> {
        self.trie
            .read()
            .expect("cache lock poisoned")
            .get(cache_key)
            .cloned()
    }

    /// Deepest cached bucket whose cache-key prefixes `hash_hex`.
    pub fn longest_match(&self, hash_hex: &str) -> Option<Arc<BucketHandle>> {
        self.trie
            .read()
            .expect("cache lock poisoned")
            .longest_match(hash_hex)
            .map(|(handle, _)| Arc::clone(handle))
    }

    /// Cache `bucket`. An existing handle for the same key is updated in
    /// place and returned.
    pub fn insert(&self, bucket: Bucket) -> Arc<BucketHandle> {
        let key = bucket.cache_key();
        let mut trie = self.trie.write().expect("cache lock poisoned");
        if let Some(existing) = trie.get(&key) {
            *existing.write() = bucket;
            return Arc::clone(existing);
        }
        let handle = Arc::new(BucketHandle::new(bucket));
        trie.insert(&key, Arc::clone(&handle));
        handle
    }

    pub fn evict(&self, cache_key: &str) -> bool {
        self.trie
            .write()
            .expect("cache lock poisoned")
            .remove(cache_key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.trie.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.trie.write().expect("cache lock poisoned") = PrefixTrie::new();
    }
}
