//! The bucket record.
//!
//! A bucket owns every item whose hash starts with its cache-key. Items are
//! grouped into shards indexed by the `shard_bits` of the hash that follow
//! `offset_bits`. A shard is either in-line (its items are stored inside
//! this record) or external (its items live in the bucket at `shard.key`).
//! Each record carries the offset and width used to index its own shards,
//! so changing the configured shard width later never re-routes anything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::ItemHash;
use crate::error::{PackerError, PackerResult};
use crate::item::Item;

/// Child descriptor inside a bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Storage key the shard has (or would have) once externalized.
    pub key: String,
    pub external: bool,
    /// In-line items. Always empty once `external` is set.
    pub items: BTreeMap<String, Vec<u8>>,
}

impl Shard {
    fn item_bytes(&self) -> usize {
        self.items.iter().map(|(id, p)| id.len() + p.len()).sum()
    }
}

/// Where an item routes within one bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// The hash has no bits left; the item lives in the bucket's own map.
    Local,
    /// In-line shard at this index (created on first insert).
    Inline(String),
    /// Continue the walk in the external bucket at this key.
    External(String),
}

/// A persisted container of items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Storage key relative to the storage prefix, e.g. `a7` or `a7/3`.
    pub key: String,
    /// Number of shard levels below the primary bucket.
    pub depth: u32,
    /// Hash bits consumed before this bucket's shard index.
    pub offset_bits: u32,
    /// Width of this bucket's shard index.
    pub shard_bits: u32,
    /// Items stored directly in the bucket (hash exhausted).
    pub items: BTreeMap<String, Vec<u8>>,
    pub shards: BTreeMap<String, Shard>,
    /// Persisted size in bytes as last read or written.
    #[serde(skip)]
    pub size: usize,
}

impl Bucket {
    pub fn new(key: impl Into<String>, depth: u32, offset_bits: u32, shard_bits: u32) -> Self {
        Self {
            key: key.into(),
            depth,
            offset_bits,
            shard_bits,
            items: BTreeMap::new(),
            shards: BTreeMap::new(),
            size: 0,
        }
    }

    /// An empty primary bucket.
    pub fn primary(key: impl Into<String>, base_bits: u32, shard_bits: u32) -> Self {
        Self::new(key, 0, base_bits, shard_bits)
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.key)
    }

    pub fn shard_key(&self, index: &str) -> String {
        format!("{}/{}", self.key, index)
    }

    pub fn route(&self, hash: &ItemHash) -> Route {
        match hash.hex_range(self.offset_bits, self.shard_bits) {
            None => Route::Local,
            Some(index) => match self.shards.get(&index) {
                Some(shard) if shard.external => Route::External(shard.key.clone()),
                _ => Route::Inline(index),
            },
        }
    }

    pub fn get(&self, hash: &ItemHash, id: &str) -> Option<Item> {
        let payload = match self.route(hash) {
            Route::Local => self.items.get(id),
            Route::Inline(index) => self.shards.get(&index).and_then(|s| s.items.get(id)),
            Route::External(_) => None,
        }?;
        Some(Item::new(id, payload.clone()))
    }

    /// Insert or replace an item, returning the route it landed on.
    pub fn upsert(&mut self, hash: &ItemHash, item: Item) -> PackerResult<Route> {
        let route = self.route(hash);
        match &route {
            Route::Local => {
                self.items.insert(item.id, item.payload);
            }
            Route::Inline(index) => {
                let key = self.shard_key(index);
                let shard = self.shards.entry(index.clone()).or_insert_with(|| Shard {
                    key,
                    ..Shard::default()
                });
                shard.items.insert(item.id, item.payload);
            }
            Route::External(key) => {
                return Err(PackerError::Internal(format!(
                    "upsert of {} into {} routes to external shard {key}",
                    item.id, self.key
                )))
            }
        }
        Ok(route)
    }

    /// Remove an item. Returns `true` if it was present.
    pub fn remove(&mut self, hash: &ItemHash, id: &str) -> bool {
        match self.route(hash) {
            Route::Local => self.items.remove(id).is_some(),
            Route::Inline(index) => self
                .shards
                .get_mut(&index)
                .is_some_and(|s| s.items.remove(id).is_some()),
            Route::External(_) => false,
        }
    }

    /// Every item held in this record.
    pub fn items(&self) -> impl Iterator<Item = Item> + '_ {
        self.items
            .iter()
            .chain(self.shards.values().flat_map(|s| s.items.iter()))
            .map(|(id, payload)| Item::new(id.clone(), payload.clone()))
    }

    pub fn item_count(&self) -> usize {
        self.items.len() + self.shards.values().map(|s| s.items.len()).sum::<usize>()
    }

    /// Keys of externalized children.
    pub fn external_keys(&self) -> Vec<String> {
        self.shards
            .values()
            .filter(|s| s.external)
            .map(|s| s.key.clone())
            .collect()
    }

    /// Indices of in-line shards that still hold items.
    pub fn populated_inline(&self) -> Vec<String> {
        self.shards
            .iter()
            .filter(|(_, s)| !s.external && !s.items.is_empty())
            .map(|(index, _)| index.clone())
            .collect()
    }

    /// Pick the in-line shard to externalize next.
    ///
    /// Prefers `hint` (the shard the triggering item landed in), then the
    /// shard with the most item bytes. A record holding at most one item is
    /// never split.
    pub fn split_candidate(&self, hint: Option<&str>) -> Option<String> {
        if self.item_count() <= 1 {
            return None;
        }
        if let Some(hint) = hint {
            if self
                .shards
                .get(hint)
                .is_some_and(|s| !s.external && !s.items.is_empty())
            {
                return Some(hint.to_string());
            }
        }
        self.shards
            .iter()
            .filter(|(_, s)| !s.external && !s.items.is_empty())
            .max_by_key(|(_, s)| s.item_bytes())
            .map(|(index, _)| index.clone())
    }

    /// Promote the in-line shard at `index` to a bucket of its own.
    ///
    /// The shard's items are re-routed one level deeper inside the returned
    /// child, and the descriptor here is marked external. Nothing is
    /// persisted.
    pub fn externalize(&mut self, index: &str, child_shard_bits: u32) -> PackerResult<Bucket> {
        let child_offset = self.offset_bits + self.shard_bits;
        let child_key = self.shard_key(index);
        let shard = self.shards.get_mut(index).ok_or_else(|| {
            PackerError::Internal(format!("no shard {index} in bucket {}", self.key))
        })?;
        if shard.external {
            return Err(PackerError::Internal(format!(
                "shard {index} of bucket {} is already external",
                self.key
            )));
        }
        shard.external = true;
        let items = std::mem::take(&mut shard.items);

        let mut child = Bucket::new(child_key, self.depth + 1, child_offset, child_shard_bits);
        for (id, payload) in items {
            let hash = ItemHash::of(&id);
            child.upsert(&hash, Item { id, payload })?;
        }
        Ok(child)
    }

    /// Mark an in-line shard as external because its bucket already exists
    /// in storage. Its in-line items are dropped. Returns `true` if the
    /// descriptor changed.
    pub fn adopt(&mut self, index: &str) -> bool {
        match self.shards.get_mut(index) {
            Some(shard) if !shard.external => {
                shard.external = true;
                shard.items.clear();
                true
            }
            _ => false,
        }
    }
}

/// Cache-key for a storage key: the key with path separators stripped.
pub fn cache_key(key: &str) -> String {
    key.replace('/', "")
}
