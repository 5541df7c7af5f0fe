//! The packer: put, get, delete and iterate over bucketed items.
//!
//! Every operation walks from the deepest cached bucket on the item's route
//! (or its primary bucket) towards the bucket that owns the item, holding
//! the striped lock of one bucket at a time. Writers mutate a copy of the
//! owning bucket, split it when it grows past the threshold, persist any new
//! child buckets before the parent, and only then publish the result to
//! the cache.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use stow_view::{collect_keys, Context, PrefixView, StorageView};
use tracing::{debug, error, info, warn};

use crate::address::{HashAddresser, ItemHash};
use crate::bucket::{cache_key, Bucket, Route};
use crate::cache::{BucketCache, BucketHandle};
use crate::codec::Codec;
use crate::config::PackerConfig;
use crate::error::{PackerError, PackerResult};
use crate::item::{validate_id, Item};
use crate::iter::{BucketIter, ItemIter};
use crate::locks::LockTable;
use crate::upgrade::Upgrader;

/// Fraction of `max_bucket_size` a bucket may reach before it is split.
const SPLIT_THRESHOLD_PERCENT: usize = 90;

/// One step of a walk towards the owner of a hash.
pub(crate) enum Step {
    /// The bucket at this key owns the hash.
    Arrived(Arc<BucketHandle>),
    /// Continue in the external child at this key.
    Descend(String),
    /// The primary bucket has never been written.
    Missing,
}

/// A child bucket produced by a split, ready to persist.
struct Pending {
    bucket: Bucket,
    bytes: Vec<u8>,
}

/// Summary of the stored bucket tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PackerStats {
    pub buckets: usize,
    pub primaries: usize,
    pub items: usize,
    pub max_depth: u32,
    pub stored_bytes: usize,
    pub largest_bucket: usize,
}

/// Content-addressed bucket packer over a [`StorageView`].
pub struct Packer {
    pub(crate) view: PrefixView,
    config: PackerConfig,
    addresser: HashAddresser,
    codec: Codec,
    cache: BucketCache,
    pub(crate) locks: LockTable,
}

impl Packer {
    /// Open a packer over `view`.
    ///
    /// Validates `config` and reconciles it with the persisted sidecar; the
    /// persisted base bits win over the configured ones.
    pub fn open(ctx: &Context, view: Arc<dyn StorageView>, config: PackerConfig) -> PackerResult<Self> {
        let mut config = config.normalized()?;

        let config_view = PrefixView::new(Arc::clone(&view), config.config_prefix.clone());
        Upgrader::new(&config_view).reconcile(ctx, &mut config)?;
        config.validate()?;

        let addresser = HashAddresser::new(config.base_bits, config.shard_bits)?;
        let locks = LockTable::new(config.lock_stripes)?;
        info!(
            base_bits = config.base_bits,
            shard_bits = config.shard_bits,
            max_bucket_size = config.max_bucket_size(),
            prefix = %config.storage_prefix,
            "packer opened"
        );

        Ok(Self {
            view: PrefixView::new(view, config.storage_prefix.clone()),
            codec: Codec::new(config.compress),
            addresser,
            cache: BucketCache::new(),
            locks,
            config,
        })
    }

    pub fn config(&self) -> &PackerConfig {
        &self.config
    }

    pub fn addresser(&self) -> &HashAddresser {
        &self.addresser
    }

    /// The view scoped to the bucket area.
    pub fn bucket_view(&self) -> &PrefixView {
        &self.view
    }

    /// Number of buckets currently cached.
    pub fn cached_buckets(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached bucket. Subsequent reads go to storage.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    // -----------------------------------------------------------------------
    // Core operations
    // -----------------------------------------------------------------------

    /// Insert or replace an item. Returns the key of the bucket it landed in.
    pub fn put_item(&self, ctx: &Context, item: &Item) -> PackerResult<String> {
        ctx.check()?;
        item.validate()?;
        let item_size = Codec::item_size(item).map_err(|e| self.internal(e.to_string()))?;
        let max = self.config.max_bucket_size();
        if item_size > max {
            return Err(PackerError::Oversize {
                id: item.id.clone(),
                size: item_size,
                max,
            });
        }

        let hash = ItemHash::of(&item.id);
        let mut key = self.start_key(&hash)?;
        loop {
            let _guard = self.locks.write(&cache_key(&key));
            let mut bucket = match self.step(ctx, &key, &hash)? {
                Step::Descend(child) => {
                    key = child;
                    continue;
                }
                Step::Arrived(handle) => {
                    if handle.read().get(&hash, &item.id).as_ref() == Some(item) {
                        debug!(id = %item.id, key = %key, "item unchanged");
                        return Ok(key);
                    }
                    handle.snapshot()
                }
                Step::Missing => {
                    Bucket::primary(key.clone(), self.addresser.base_bits(), self.addresser.shard_bits())
                }
            };

            bucket.upsert(&hash, item.clone())?;
            let estimate = bucket.size + item_size;
            let mut pending = Vec::new();
            let bytes = self.fit(&mut bucket, Some(estimate), &hash, &item.id, &mut pending)?;
            let landed = landing_key(&bucket, &pending, &hash);
            self.commit(ctx, bucket, bytes, pending)?;
            debug!(id = %item.id, key = %landed, "item stored");
            return Ok(landed);
        }
    }

    /// Fetch an item, or `None` if it was never stored or has been deleted.
    pub fn get_item(&self, ctx: &Context, id: &str) -> PackerResult<Option<Item>> {
        self.read_owner(ctx, id, |bucket, hash| bucket.and_then(|b| b.get(hash, id)))
    }

    /// Remove an item. Removing an absent item is a no-op. Buckets are never
    /// merged back into their parents.
    pub fn delete_item(&self, ctx: &Context, id: &str) -> PackerResult<()> {
        ctx.check()?;
        validate_id(id)?;
        let hash = ItemHash::of(id);
        let mut key = self.start_key(&hash)?;
        loop {
            let _guard = self.locks.write(&cache_key(&key));
            let handle = match self.step(ctx, &key, &hash)? {
                Step::Descend(child) => {
                    key = child;
                    continue;
                }
                Step::Arrived(handle) => handle,
                Step::Missing => return Ok(()),
            };

            if handle.read().get(&hash, id).is_none() {
                return Ok(());
            }
            let mut bucket = handle.snapshot();
            bucket.remove(&hash, id);
            let bytes = self.encode(&bucket)?;
            self.commit(ctx, bucket, bytes, Vec::new())?;
            debug!(id, key = %key, "item deleted");
            return Ok(());
        }
    }

    /// Lazily iterate items whose location key starts with `prefix`.
    ///
    /// A location key is the shard key an item routes to inside its bucket
    /// (`a7/3`), so prefixes select hash ranges regardless of how far they
    /// have been split. Writes racing with the iteration may or may not be
    /// observed.
    pub fn iterate(&self, ctx: &Context, prefix: &str) -> ItemIter<'_> {
        ItemIter::new(self, ctx.clone(), prefix)
    }

    // -----------------------------------------------------------------------
    // Batch and inspection
    // -----------------------------------------------------------------------

    /// Store several items. The batch is validated before anything is written.
    pub fn put_items(&self, ctx: &Context, items: &[Item]) -> PackerResult<Vec<String>> {
        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            item.validate()?;
            if !seen.insert(item.id.as_str()) {
                return Err(PackerError::InvalidArgument(format!(
                    "duplicate item ID {} in batch",
                    item.id
                )));
            }
        }
        items.iter().map(|item| self.put_item(ctx, item)).collect()
    }

    /// Fetch several items; absent ids yield `None` at their position.
    pub fn get_items(&self, ctx: &Context, ids: &[&str]) -> PackerResult<Vec<Option<Item>>> {
        ids.iter().map(|id| self.get_item(ctx, id)).collect()
    }

    pub fn delete_items(&self, ctx: &Context, ids: &[&str]) -> PackerResult<()> {
        for id in ids {
            validate_id(id)?;
        }
        ids.iter().try_for_each(|id| self.delete_item(ctx, id))
    }

    pub fn all_items(&self, ctx: &Context) -> PackerResult<Vec<Item>> {
        self.iterate(ctx, "").collect()
    }

    /// Snapshot of the bucket that owns `id`'s route, if it exists.
    pub fn bucket_for(&self, ctx: &Context, id: &str) -> PackerResult<Option<Bucket>> {
        self.read_owner(ctx, id, |bucket, _| bucket.cloned())
    }

    /// Storage key of the location `id` routes to: the in-line shard key,
    /// or the bucket key once the hash is exhausted.
    pub fn locate(&self, ctx: &Context, id: &str) -> PackerResult<String> {
        let base = self.addresser.base_bits();
        let shard = self.addresser.shard_bits();
        let primary = self.addresser.primary_index(id);
        self.read_owner(ctx, id, |bucket, hash| {
            let empty;
            let bucket = match bucket {
                Some(b) => b,
                None => {
                    empty = Bucket::primary(primary.clone(), base, shard);
                    &empty
                }
            };
            match bucket.route(hash) {
                Route::Inline(index) => bucket.shard_key(&index),
                Route::Local | Route::External(_) => bucket.key.clone(),
            }
        })
    }

    /// Walk every stored bucket and summarize the tree.
    pub fn stats(&self, ctx: &Context) -> PackerResult<PackerStats> {
        let mut stats = PackerStats::default();
        for bucket in BucketIter::new(self, ctx.clone(), "") {
            let bucket = bucket?;
            stats.buckets += 1;
            if bucket.depth == 0 {
                stats.primaries += 1;
            }
            stats.items += bucket.item_count();
            stats.max_depth = stats.max_depth.max(bucket.depth);
            stats.stored_bytes += bucket.size;
            stats.largest_bucket = stats.largest_bucket.max(bucket.size);
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Walking
    // -----------------------------------------------------------------------

    /// Walk to the owner of `id` under read locks and apply `f` to it.
    fn read_owner<T>(
        &self,
        ctx: &Context,
        id: &str,
        f: impl FnOnce(Option<&Bucket>, &ItemHash) -> T,
    ) -> PackerResult<T> {
        ctx.check()?;
        validate_id(id)?;
        let hash = ItemHash::of(id);
        let mut key = self.start_key(&hash)?;
        loop {
            let _guard = self.locks.read(&cache_key(&key));
            match self.step(ctx, &key, &hash)? {
                Step::Descend(child) => key = child,
                Step::Arrived(handle) => {
                    let bucket = handle.read();
                    return Ok(f(Some(&*bucket), &hash));
                }
                Step::Missing => return Ok(f(None, &hash)),
            }
        }
    }

    /// Where a walk for `hash` starts: the deepest cached bucket on its
    /// route, else its primary bucket.
    fn start_key(&self, hash: &ItemHash) -> PackerResult<String> {
        let primary = self.addresser.primary_of(hash);
        let hex = hash.to_hex();
        let Some(handle) = self.cache.longest_match(&hex) else {
            return Ok(primary);
        };
        let key = handle.read().key.clone();
        let matched = cache_key(&key);
        if !hex.starts_with(&matched) || !matched.starts_with(&primary) {
            return Err(self.internal(format!(
                "cache returned bucket {key} for hash {hex} with primary {primary}"
            )));
        }
        Ok(key)
    }

    /// Load the bucket at `key` and route `hash` within it. The caller holds
    /// the bucket's stripe lock.
    pub(crate) fn step(&self, ctx: &Context, key: &str, hash: &ItemHash) -> PackerResult<Step> {
        let Some(handle) = self.load(ctx, key)? else {
            if is_primary(key) {
                return Ok(Step::Missing);
            }
            return Err(PackerError::corrupt(key, "external bucket is missing"));
        };
        let route = handle.read().route(hash);
        Ok(match route {
            Route::External(child) => Step::Descend(child),
            Route::Local | Route::Inline(_) => Step::Arrived(handle),
        })
    }

    /// Fetch a bucket from the cache, or from storage on a miss. The caller
    /// holds the bucket's stripe lock.
    pub(crate) fn load(&self, ctx: &Context, key: &str) -> PackerResult<Option<Arc<BucketHandle>>> {
        if let Some(handle) = self.cache.get(&cache_key(key)) {
            return Ok(Some(handle));
        }
        let Some(bytes) = self.view.get(ctx, key)? else {
            return Ok(None);
        };
        let mut bucket = self
            .codec
            .decode(&bytes)
            .map_err(|e| PackerError::corrupt(key, e))?;
        if bucket.key != key {
            return Err(PackerError::corrupt(
                key,
                format!("record carries key {}", bucket.key),
            ));
        }
        self.reconcile(ctx, &mut bucket)?;
        debug!(key, size = bucket.size, depth = bucket.depth, "bucket loaded");
        Ok(Some(self.cache.insert(bucket)))
    }

    /// Bring a freshly loaded bucket in line with child buckets left in
    /// storage by an interrupted split.
    ///
    /// A stored child whose in-line shard still holds items was written by
    /// a split whose parent write never landed; it holds a superset of those
    /// items and is adopted. A stored child whose in-line shard is empty or
    /// absent is left over from an attempt whose triggering write failed and
    /// is deleted, so it can never shadow later in-line items.
    fn reconcile(&self, ctx: &Context, bucket: &mut Bucket) -> PackerResult<()> {
        let children = self.view.list(ctx, &format!("{}/", bucket.key))?;
        for name in children.iter().filter(|n| !n.ends_with('/')) {
            let child_key = bucket.shard_key(name);
            let adopt = match bucket.shards.get(name.as_str()) {
                Some(shard) if shard.external => continue,
                Some(shard) => !shard.items.is_empty(),
                None => false,
            };
            if adopt {
                bucket.adopt(name);
                info!(key = %child_key, "adopted child bucket from interrupted split");
            } else {
                self.purge(ctx, &child_key)?;
                self.view.delete(ctx, &child_key)?;
                warn!(key = %child_key, "removed stale child bucket");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Splitting and persistence
    // -----------------------------------------------------------------------

    fn threshold(&self) -> usize {
        self.config.max_bucket_size() * SPLIT_THRESHOLD_PERCENT / 100
    }

    /// Encode `bucket`, splitting off in-line shards until it fits.
    ///
    /// With a size estimate under the threshold the bucket is accepted as
    /// long as it stays within `max_bucket_size`. Otherwise shards are
    /// externalized (the one holding `trigger` first) until the encoding is
    /// under the threshold or nothing is left to split. New children are
    /// pushed to `pending` deepest first.
    fn fit(
        &self,
        bucket: &mut Bucket,
        estimate: Option<usize>,
        trigger: &ItemHash,
        trigger_id: &str,
        pending: &mut Vec<Pending>,
    ) -> PackerResult<Vec<u8>> {
        let max = self.config.max_bucket_size();
        let threshold = self.threshold();

        if estimate.is_some_and(|e| e <= threshold) {
            let bytes = self.encode(bucket)?;
            if bytes.len() <= max {
                return Ok(bytes);
            }
        }

        loop {
            let bytes = self.encode(bucket)?;
            if bytes.len() <= threshold {
                return Ok(bytes);
            }
            let hint = match bucket.route(trigger) {
                Route::Inline(index) => Some(index),
                _ => None,
            };
            let Some(index) = bucket.split_candidate(hint.as_deref()) else {
                if bytes.len() <= max {
                    return Ok(bytes);
                }
                return Err(PackerError::Oversize {
                    id: trigger_id.to_string(),
                    size: bytes.len(),
                    max,
                });
            };

            let mut child = bucket.externalize(&index, self.addresser.shard_bits())?;
            info!(
                parent = %bucket.key,
                child = %child.key,
                depth = child.depth,
                items = child.item_count(),
                "externalizing shard"
            );
            let child_bytes = self.fit(&mut child, None, trigger, trigger_id, pending)?;
            pending.push(Pending {
                bucket: child,
                bytes: child_bytes,
            });
        }
    }

    /// Persist new children, then the parent, then publish to the cache.
    ///
    /// On failure the parent is evicted so the next access re-reads storage
    /// and reconciles whatever part of the split landed.
    fn commit(&self, ctx: &Context, mut parent: Bucket, bytes: Vec<u8>, pending: Vec<Pending>) -> PackerResult<()> {
        let persisted = (|| -> PackerResult<()> {
            for child in &pending {
                self.purge(ctx, &child.bucket.key)?;
            }
            for child in &pending {
                self.view.put(ctx, &child.bucket.key, &child.bytes)?;
                debug!(
                    key = %child.bucket.key,
                    size = child.bytes.len(),
                    depth = child.bucket.depth,
                    "child bucket persisted"
                );
            }
            self.view.put(ctx, &parent.key, &bytes)?;
            Ok(())
        })();

        if let Err(err) = persisted {
            warn!(key = %parent.key, error = %err, "bucket commit failed; evicting");
            self.cache.evict(&parent.cache_key());
            return Err(err);
        }

        debug!(key = %parent.key, size = bytes.len(), "bucket persisted");
        for Pending { mut bucket, bytes } in pending {
            bucket.size = bytes.len();
            self.cache.insert(bucket);
        }
        parent.size = bytes.len();
        self.cache.insert(parent);
        Ok(())
    }

    /// Delete every stored key below `key/`.
    fn purge(&self, ctx: &Context, key: &str) -> PackerResult<()> {
        let stale = collect_keys(&self.view, ctx, &format!("{key}/"))?;
        for stale_key in &stale {
            self.view.delete(ctx, stale_key)?;
        }
        if !stale.is_empty() {
            warn!(key, removed = stale.len(), "purged stale descendants");
        }
        Ok(())
    }

    fn encode(&self, bucket: &Bucket) -> PackerResult<Vec<u8>> {
        self.codec
            .encode(bucket)
            .map_err(|e| self.internal(format!("encoding bucket {}: {e}", bucket.key)))
    }

    fn internal(&self, message: String) -> PackerError {
        error!(%message, "packer invariant violated");
        PackerError::Internal(message)
    }
}

impl std::fmt::Debug for Packer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packer")
            .field("prefix", &self.config.storage_prefix)
            .field("base_bits", &self.config.base_bits)
            .field("shard_bits", &self.config.shard_bits)
            .field("cached_buckets", &self.cache.len())
            .finish()
    }
}

fn is_primary(key: &str) -> bool {
    !key.contains('/')
}

/// Key of the bucket holding `hash` after a split produced `pending`.
fn landing_key(bucket: &Bucket, pending: &[Pending], hash: &ItemHash) -> String {
    let mut current = bucket;
    while let Route::External(child) = current.route(hash) {
        match pending.iter().find(|p| p.bucket.key == child) {
            Some(p) => current = &p.bucket,
            None => return child,
        }
    }
    current.key.clone()
}
