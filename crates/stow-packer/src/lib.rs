//! # stow-packer
//!
//! Packs very many small items into few persisted buckets over a
//! [`StorageView`](stow_view::StorageView).
//!
//! Each item's identifier is hashed; the leading hash bits pick a primary
//! bucket and each following group of bits picks a shard inside it. A
//! bucket that would outgrow its size limit externalizes a shard into a
//! child bucket of its own, recursively, so no stored entry exceeds the
//! backend's per-entry ceiling.
//!
//! ```text
//! packer/buckets/a7       primary bucket, shards 0..f in-line
//! packer/buckets/a7/3     shard 3 of a7, externalized
//! packer/config/config    JSON sidecar freezing base_bits
//! ```
//!
//! Buckets are cached in a prefix trie keyed by their hex address, and
//! writers are serialized per bucket by a striped lock table.

pub mod address;
pub mod bucket;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod item;
pub mod iter;
pub mod locks;
pub mod packer;
pub mod upgrade;

#[cfg(test)]
mod scenarios;

pub use address::{HashAddresser, ItemHash};
pub use bucket::{Bucket, Route, Shard};
pub use codec::{Codec, CodecError, Framing};
pub use config::{BackendClass, PackerConfig};
pub use error::{ErrorKind, PackerError, PackerResult};
pub use item::Item;
pub use iter::{BucketIter, ItemIter};
pub use packer::{Packer, PackerStats};
pub use upgrade::{PersistedConfig, UpgradeOutcome, Upgrader};
