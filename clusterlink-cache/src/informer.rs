//! Capability interface every per-kind cache exposes to higher layers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use clusterlink_core::{CachedObject, ObjectKey, ResourceKind, WatchEvent};

/// Hook invoked on every accepted cache mutation, after the cache was updated.
///
/// Called from the watcher's event pump; implementations must not block.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &WatchEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&WatchEvent) + Send + Sync,
{
    fn on_event(&self, event: &WatchEvent) {
        self(event)
    }
}

/// What resource modules may rely on from a kind's cache.
pub trait Informer: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Start the event pump. Idempotent.
    fn start(&self, shutdown: &CancellationToken);

    /// True once the initial listing completed; never reverts.
    fn has_synced(&self) -> bool;

    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<CachedObject>>;

    /// Every cached object, sorted by key.
    fn list(&self) -> Vec<Arc<CachedObject>>;

    fn subscribe(&self, handler: Arc<dyn EventHandler>);
}
