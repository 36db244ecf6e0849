//! Control-plane collaborator seam: the native list + watch primitive.

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use clusterlink_core::{CachedObject, ResourceKind, WatchEvent};

use crate::error::SourceError;

/// Stream of events newer than the resource version the watch was opened at.
/// Ends (or yields an error) when the watch must be re-established.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, SourceError>> + Send>>;

/// Full listing of one kind at a point in time.
#[derive(Debug, Clone, Default)]
pub struct ListSnapshot {
    pub resource_version: u64,
    pub objects: Vec<CachedObject>,
}

/// List and watch one resource kind. Implementations own the transport to the
/// control plane; the cache only relies on these two calls.
#[async_trait]
pub trait ListWatch: Send + Sync + 'static {
    async fn list(&self, kind: ResourceKind) -> Result<ListSnapshot, SourceError>;

    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: u64,
    ) -> Result<WatchStream, SourceError>;
}
