//! # stow-view
//!
//! The storage contract underneath the stow bucket packer.
//!
//! A [`StorageView`] is a flat key/value store with hierarchical listing:
//! `get`, `put`, `delete` and one-level `list`. The packer never assumes
//! anything else about its backend. Every call carries a [`Context`] for
//! cancellation and deadlines.
//!
//! Backends:
//! - [`InMemoryView`]: BTreeMap-backed, with an optional per-value ceiling.
//! - [`FileView`]: one file per key under a root directory.
//! - [`PrefixView`]: scopes another view under a key prefix.

pub mod context;
pub mod error;
pub mod file;
pub mod memory;
pub mod prefix;
pub mod traits;

pub use context::Context;
pub use error::{ViewError, ViewResult};
pub use file::FileView;
pub use memory::InMemoryView;
pub use prefix::PrefixView;
pub use traits::{collect_keys, validate_key, StorageView};
