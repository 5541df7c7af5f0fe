use crate::context::Context;
use crate::error::{ViewError, ViewResult};

/// Opaque key/value storage consumed by the packer.
///
/// All implementations must satisfy these invariants:
/// - Safe under concurrent use from many threads.
/// - Read-your-writes per key within a process.
/// - Every call checks its [`Context`] before doing work.
/// - The view never interprets values; it stores bytes.
pub trait StorageView: Send + Sync {
    /// Read the value stored at `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    fn get(&self, ctx: &Context, key: &str) -> ViewResult<Option<Vec<u8>>>;

    /// Create or replace the value stored at `key`.
    fn put(&self, ctx: &Context, key: &str, value: &[u8]) -> ViewResult<()>;

    /// Remove `key`. Deleting a missing key is not an error.
    fn delete(&self, ctx: &Context, key: &str) -> ViewResult<()>;

    /// List the immediate children of `prefix`.
    ///
    /// A child that is itself a key is returned as its bare name; a child
    /// that has descendants is returned with a trailing `/`. Both forms may
    /// be present for the same name. Results are sorted.
    fn list(&self, ctx: &Context, prefix: &str) -> ViewResult<Vec<String>>;
}

/// Recursively collect every key under `prefix`, relative to the view.
pub fn collect_keys(view: &dyn StorageView, ctx: &Context, prefix: &str) -> ViewResult<Vec<String>> {
    let mut keys = Vec::new();
    let mut pending = vec![prefix.to_string()];
    while let Some(dir) = pending.pop() {
        for name in view.list(ctx, &dir)? {
            let full = format!("{dir}{name}");
            if name.ends_with('/') {
                pending.push(full);
            } else {
                keys.push(full);
            }
        }
    }
    keys.sort();
    Ok(keys)
}

/// Reject keys no backend can represent faithfully.
pub fn validate_key(key: &str) -> ViewResult<()> {
    let invalid = |reason: &str| ViewError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    for segment in key.split('/') {
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }
        if segment == "." || segment == ".." {
            return Err(invalid("relative path segment"));
        }
    }
    Ok(())
}

/// Immediate children of `prefix` among a sorted set of keys.
///
/// Shared by the backends that keep keys in an ordered map.
pub(crate) fn immediate_children<'a>(
    keys: impl Iterator<Item = &'a String>,
    prefix: &str,
) -> Vec<String> {
    let mut out: Vec<String> = keys
        .filter_map(|key| key.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .map(|rest| match rest.find('/') {
            Some(pos) => rest[..=pos].to_string(),
            None => rest.to_string(),
        })
        .collect();
    out.sort();
    out.dedup();
    out
}
