//! Typed, read-only access to every synced watcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use clusterlink_core::ResourceKind;

use crate::informer::Informer;
use crate::watcher::Watcher;

/// Built once by [`SyncManager::start_all`](crate::SyncManager::start_all);
/// only contains watchers whose cache completed the initial listing.
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    watchers: Arc<BTreeMap<ResourceKind, Watcher>>,
}

impl ResourceRegistry {
    pub(crate) fn from_synced(watchers: BTreeMap<ResourceKind, Watcher>) -> Self {
        debug_assert!(watchers.values().all(Watcher::has_synced));
        Self {
            watchers: Arc::new(watchers),
        }
    }

    /// Watcher for `kind`.
    ///
    /// # Panics
    ///
    /// If `kind` was never synchronized. Asking for it is a wiring bug, not a
    /// runtime condition.
    pub fn watcher(&self, kind: ResourceKind) -> &Watcher {
        match self.watchers.get(&kind) {
            Some(watcher) => watcher,
            None => panic!(
                "resource kind '{kind}' was never synchronized; add it to the configured kinds"
            ),
        }
    }

    pub fn try_watcher(&self, kind: ResourceKind) -> Option<&Watcher> {
        self.watchers.get(&kind)
    }

    /// The kind's cache behind the capability interface.
    pub fn informer(&self, kind: ResourceKind) -> Arc<dyn Informer> {
        Arc::new(self.watcher(kind).clone())
    }

    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.watchers.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.watchers.keys().copied().collect()
    }

    pub fn pods(&self) -> &Watcher {
        self.watcher(ResourceKind::Pod)
    }

    pub fn namespaces(&self) -> &Watcher {
        self.watcher(ResourceKind::Namespace)
    }

    pub fn nodes(&self) -> &Watcher {
        self.watcher(ResourceKind::Node)
    }

    pub fn config_maps(&self) -> &Watcher {
        self.watcher(ResourceKind::ConfigMap)
    }

    pub fn deployments(&self) -> &Watcher {
        self.watcher(ResourceKind::Deployment)
    }

    pub fn stateful_sets(&self) -> &Watcher {
        self.watcher(ResourceKind::StatefulSet)
    }

    pub fn daemon_sets(&self) -> &Watcher {
        self.watcher(ResourceKind::DaemonSet)
    }

    pub fn events(&self) -> &Watcher {
        self.watcher(ResourceKind::Event)
    }

    pub fn persistent_volumes(&self) -> &Watcher {
        self.watcher(ResourceKind::PersistentVolume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryControlPlane;
    use crate::SyncManager;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn registry_for(kinds: &[ResourceKind]) -> (ResourceRegistry, CancellationToken) {
        let shutdown = CancellationToken::new();
        let manager = SyncManager::new(
            Arc::new(MemoryControlPlane::new()),
            shutdown.clone(),
            Duration::from_secs(5),
        );
        let registry = manager.start_all(kinds, true).await.expect("sync");
        (registry, shutdown)
    }

    #[tokio::test]
    async fn typed_accessors_return_matching_kind() {
        let (registry, shutdown) =
            registry_for(&[ResourceKind::Pod, ResourceKind::ConfigMap]).await;
        assert_eq!(registry.pods().kind(), ResourceKind::Pod);
        assert_eq!(registry.config_maps().kind(), ResourceKind::ConfigMap);
        assert!(registry.try_watcher(ResourceKind::Node).is_none());
        assert!(registry.informer(ResourceKind::Pod).has_synced());
        shutdown.cancel();
    }

    #[tokio::test]
    #[should_panic(expected = "never synchronized")]
    async fn unsynced_kind_is_a_programmer_error() {
        let (registry, _shutdown) = registry_for(&[ResourceKind::Pod]).await;
        let _ = registry.nodes();
    }
}
