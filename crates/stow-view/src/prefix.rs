use std::sync::Arc;

use crate::context::Context;
use crate::error::ViewResult;
use crate::traits::StorageView;

/// A view that scopes every key under a fixed prefix of another view.
///
/// The packer stores buckets and its config sidecar under separate prefixes
/// of one backend; each gets its own `PrefixView`.
#[derive(Clone)]
pub struct PrefixView {
    inner: Arc<dyn StorageView>,
    prefix: String,
}

impl PrefixView {
    pub fn new(inner: Arc<dyn StorageView>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl StorageView for PrefixView {
    fn get(&self, ctx: &Context, key: &str) -> ViewResult<Option<Vec<u8>>> {
        self.inner.get(ctx, &self.scoped(key))
    }

    fn put(&self, ctx: &Context, key: &str, value: &[u8]) -> ViewResult<()> {
        self.inner.put(ctx, &self.scoped(key), value)
    }

    fn delete(&self, ctx: &Context, key: &str) -> ViewResult<()> {
        self.inner.delete(ctx, &self.scoped(key))
    }

    fn list(&self, ctx: &Context, prefix: &str) -> ViewResult<Vec<String>> {
        self.inner.list(ctx, &self.scoped(prefix))
    }
}

impl std::fmt::Debug for PrefixView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixView")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
