use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{PackerError, PackerResult};

/// Fixed table of reader/writer locks striped by bucket cache-key.
///
/// Distinct keys may share a stripe; that only serializes them. Callers
/// never hold two stripes at once: descending into a child bucket releases
/// the parent's stripe first.
pub struct LockTable {
    stripes: Vec<RwLock<()>>,
    mask: usize,
}

impl LockTable {
    /// Create a table with `count` stripes. `count` must be a power of two.
    pub fn new(count: usize) -> PackerResult<Self> {
        if count == 0 || !count.is_power_of_two() {
            return Err(PackerError::InvalidArgument(format!(
                "lock stripe count {count} is not a power of two"
            )));
        }
        Ok(Self {
            stripes: (0..count).map(|_| RwLock::new(())).collect(),
            mask: count - 1,
        })
    }

    pub fn stripe_of(&self, cache_key: &str) -> usize {
        crc32fast::hash(cache_key.as_bytes()) as usize & self.mask
    }

    pub fn read(&self, cache_key: &str) -> RwLockReadGuard<'_, ()> {
        self.stripes[self.stripe_of(cache_key)]
            .read()
            .expect("stripe lock poisoned")
    }

    pub fn write(&self, cache_key: &str) -> RwLockWriteGuard<'_, ()> {
        self.stripes[self.stripe_of(cache_key)]
            .write()
            .expect("stripe lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}
