//! Shared factory handing out one [`Watcher`] per resource kind.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use clusterlink_core::ResourceKind;

use crate::source::ListWatch;
use crate::watcher::{Backoff, Watcher};

/// All watchers share one control-plane source and one shutdown signal.
pub struct SharedWatcherFactory {
    source: Arc<dyn ListWatch>,
    shutdown: CancellationToken,
    backoff: Backoff,
    watchers: Mutex<BTreeMap<ResourceKind, Watcher>>,
}

impl SharedWatcherFactory {
    pub fn new(source: Arc<dyn ListWatch>, shutdown: CancellationToken) -> Self {
        Self::with_backoff(source, shutdown, Backoff::default())
    }

    pub fn with_backoff(
        source: Arc<dyn ListWatch>,
        shutdown: CancellationToken,
        backoff: Backoff,
    ) -> Self {
        Self {
            source,
            shutdown,
            backoff,
            watchers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get the kind's watcher, creating it (unstarted) on first request.
    pub fn watcher_for(&self, kind: ResourceKind) -> Watcher {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_insert_with(|| Watcher::new(kind, Arc::clone(&self.source), self.backoff))
            .clone()
    }

    /// Start every watcher created so far. Watchers already running are left
    /// alone, so calling this repeatedly is cheap.
    pub fn start(&self) {
        let pending: Vec<Watcher> = self
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|watcher| !watcher.is_started())
            .cloned()
            .collect();
        for watcher in pending {
            watcher.start(&self.shutdown);
        }
    }

    pub fn watchers(&self) -> Vec<Watcher> {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryControlPlane;
    use crate::watcher::WatcherState;

    #[tokio::test]
    async fn same_kind_yields_same_watcher() {
        let factory =
            SharedWatcherFactory::new(Arc::new(MemoryControlPlane::new()), CancellationToken::new());
        let a = factory.watcher_for(ResourceKind::Pod);
        let b = factory.watcher_for(ResourceKind::Pod);
        let c = factory.watcher_for(ResourceKind::Node);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(factory.watchers().len(), 2);
    }

    #[tokio::test]
    async fn start_only_touches_created_watchers() {
        let shutdown = CancellationToken::new();
        let factory =
            SharedWatcherFactory::new(Arc::new(MemoryControlPlane::new()), shutdown.clone());
        let pod = factory.watcher_for(ResourceKind::Pod);
        assert_eq!(pod.state(), WatcherState::Uninitialized);

        factory.start();
        assert!(pod.is_started());
        let node = factory.watcher_for(ResourceKind::Node);
        assert!(!node.is_started());

        factory.start();
        assert!(node.is_started());
        shutdown.cancel();
    }
}
