use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::context::Context;
use crate::error::{ViewError, ViewResult};
use crate::traits::{immediate_children, validate_key, StorageView};

/// In-memory, BTreeMap-based storage view.
///
/// Intended for tests and embedding. Entries are held behind a `RwLock` for
/// safe concurrent access and cloned on read. An optional per-entry ceiling
/// mimics backends that cap value sizes.
pub struct InMemoryView {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    max_value_size: Option<usize>,
}

impl InMemoryView {
    /// Create a new empty view with no value ceiling.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_value_size: None,
        }
    }

    /// Create a new empty view that rejects values over `max` bytes.
    pub fn with_max_value_size(max: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_value_size: Some(max),
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored values.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .read()
            .expect("lock poisoned")
            .values()
            .map(|v| v.len() as u64)
            .sum()
    }

    /// All keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.write().expect("lock poisoned").clear();
    }
}

impl Default for InMemoryView {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageView for InMemoryView {
    fn get(&self, ctx: &Context, key: &str) -> ViewResult<Option<Vec<u8>>> {
        ctx.check()?;
        let map = self.entries.read().expect("lock poisoned");
        Ok(map.get(key).cloned())
    }

    fn put(&self, ctx: &Context, key: &str, value: &[u8]) -> ViewResult<()> {
        ctx.check()?;
        validate_key(key)?;
        if let Some(max) = self.max_value_size {
            if value.len() > max {
                return Err(ViewError::ValueTooLarge {
                    key: key.to_string(),
                    size: value.len(),
                    max,
                });
            }
        }
        let mut map = self.entries.write().expect("lock poisoned");
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, ctx: &Context, key: &str) -> ViewResult<()> {
        ctx.check()?;
        let mut map = self.entries.write().expect("lock poisoned");
        map.remove(key);
        Ok(())
    }

    fn list(&self, ctx: &Context, prefix: &str) -> ViewResult<Vec<String>> {
        ctx.check()?;
        let map = self.entries.read().expect("lock poisoned");
        let keys = map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k);
        Ok(immediate_children(keys, prefix))
    }
}

impl std::fmt::Debug for InMemoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryView")
            .field("entry_count", &self.len())
            .field("max_value_size", &self.max_value_size)
            .finish()
    }
}
