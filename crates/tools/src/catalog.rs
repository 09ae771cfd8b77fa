//! Tool catalog with a TTL cache in front of it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use turnflow_core::cache::TtlCache;
use turnflow_core::error::ToolError;
use turnflow_core::provider::ToolDefinition;
use turnflow_core::tool::ToolCatalog;

/// Wraps any [`ToolCatalog`] and serves its listing from a [`TtlCache`].
///
/// A failed fetch is returned to the caller and not cached, so the next
/// call tries again.
pub struct CachedCatalog {
    inner: Arc<dyn ToolCatalog>,
    cache: TtlCache<Vec<ToolDefinition>>,
}

impl CachedCatalog {
    pub fn new(inner: Arc<dyn ToolCatalog>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl),
        }
    }
}

#[async_trait]
impl ToolCatalog for CachedCatalog {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        self.cache
            .get_or_refresh(|| async {
                let tools = self.inner.list_tools().await?;
                debug!(count = tools.len(), "Tool catalog refreshed");
                Ok(tools)
            })
            .await
    }
}
