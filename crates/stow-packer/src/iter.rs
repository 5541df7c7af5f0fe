//! Lazy traversal of the stored bucket tree.
//!
//! Traversal starts at the primary buckets listed at the root of the bucket
//! area and follows external shard descriptors downwards, so child buckets
//! left behind by an interrupted split are never visited. Each bucket is
//! read under its stripe lock and copied out; the lock is not held while
//! the caller consumes the results.

use stow_view::{Context, StorageView};

use crate::bucket::{cache_key, Bucket};
use crate::error::{PackerError, PackerResult};
use crate::item::Item;
use crate::packer::Packer;

/// Iterator over snapshots of every reachable bucket related to a prefix.
pub struct BucketIter<'a> {
    packer: &'a Packer,
    ctx: Context,
    prefix: String,
    /// Keys still to visit; `None` until the roots have been listed.
    pending: Option<Vec<String>>,
    done: bool,
}

impl<'a> BucketIter<'a> {
    pub(crate) fn new(packer: &'a Packer, ctx: Context, prefix: &str) -> Self {
        Self {
            packer,
            ctx,
            prefix: prefix.to_string(),
            pending: None,
            done: false,
        }
    }

    fn advance(&mut self) -> PackerResult<Option<Bucket>> {
        if self.pending.is_none() {
            let mut roots: Vec<String> = self
                .packer
                .view
                .list(&self.ctx, "")?
                .into_iter()
                .filter(|name| !name.ends_with('/') && related(name, &self.prefix))
                .collect();
            roots.reverse();
            self.pending = Some(roots);
        }

        loop {
            let Some(key) = self.pending.as_mut().and_then(Vec::pop) else {
                return Ok(None);
            };
            let bucket = {
                let _guard = self.packer.locks.read(&cache_key(&key));
                match self.packer.load(&self.ctx, &key)? {
                    Some(handle) => handle.snapshot(),
                    None if !key.contains('/') => continue,
                    None => return Err(PackerError::corrupt(key, "external bucket is missing")),
                }
            };

            let mut children: Vec<String> = bucket
                .external_keys()
                .into_iter()
                .filter(|child| related(child, &self.prefix))
                .collect();
            children.reverse();
            if let Some(pending) = self.pending.as_mut() {
                pending.extend(children);
            }
            return Ok(Some(bucket));
        }
    }
}

impl Iterator for BucketIter<'_> {
    type Item = PackerResult<Bucket>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(bucket)) => Some(Ok(bucket)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Iterator over items whose location key starts with a prefix.
///
/// Yields at most one error, after which it is exhausted.
pub struct ItemIter<'a> {
    buckets: BucketIter<'a>,
    prefix: String,
    current: std::vec::IntoIter<Item>,
}

impl<'a> ItemIter<'a> {
    pub(crate) fn new(packer: &'a Packer, ctx: Context, prefix: &str) -> Self {
        Self {
            buckets: BucketIter::new(packer, ctx, prefix),
            prefix: prefix.to_string(),
            current: Vec::new().into_iter(),
        }
    }
}

impl Iterator for ItemIter<'_> {
    type Item = PackerResult<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(Ok(item));
            }
            match self.buckets.next()? {
                Ok(bucket) => self.current = items_under(&bucket, &self.prefix).into_iter(),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Items of `bucket` whose location key starts with `prefix`.
fn items_under(bucket: &Bucket, prefix: &str) -> Vec<Item> {
    let mut out = Vec::new();
    if bucket.key.starts_with(prefix) {
        out.extend(
            bucket
                .items
                .iter()
                .map(|(id, payload)| Item::new(id.clone(), payload.clone())),
        );
    }
    for shard in bucket.shards.values() {
        if !shard.external && shard.key.starts_with(prefix) {
            out.extend(
                shard
                    .items
                    .iter()
                    .map(|(id, payload)| Item::new(id.clone(), payload.clone())),
            );
        }
    }
    out
}

/// Whether a subtree rooted at `key` can hold locations under `prefix`.
fn related(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix) || prefix.starts_with(key)
}
