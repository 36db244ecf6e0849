//! Cache synchronization manager: the bootstrap readiness gate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use clusterlink_core::{AgentConfig, ResourceKind};

use crate::error::CacheError;
use crate::factory::SharedWatcherFactory;
use crate::registry::ResourceRegistry;
use crate::source::ListWatch;
use crate::sync::wait_for_cache_sync;
use crate::watcher::{Backoff, Watcher};

/// Starts per-kind watchers and waits, bounded, for their caches to sync.
pub struct SyncManager {
    factory: SharedWatcherFactory,
    timeout: Duration,
}

impl SyncManager {
    pub fn new(source: Arc<dyn ListWatch>, shutdown: CancellationToken, timeout: Duration) -> Self {
        Self {
            factory: SharedWatcherFactory::new(source, shutdown),
            timeout,
        }
    }

    pub fn with_backoff(
        source: Arc<dyn ListWatch>,
        shutdown: CancellationToken,
        timeout: Duration,
        backoff: Backoff,
    ) -> Self {
        Self {
            factory: SharedWatcherFactory::with_backoff(source, shutdown, backoff),
            timeout,
        }
    }

    pub fn from_config(
        source: Arc<dyn ListWatch>,
        shutdown: CancellationToken,
        config: &AgentConfig,
    ) -> Self {
        Self::new(source, shutdown, config.sync_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn factory(&self) -> &SharedWatcherFactory {
        &self.factory
    }

    /// Start `kind` and block until its cache is synced.
    ///
    /// Idempotent: an already synced kind returns its watcher immediately and
    /// is not relisted. On `SyncTimeout` or `ControlPlaneUnavailable` the
    /// watcher stays registered and running, so a later call can succeed.
    pub async fn start(&self, kind: ResourceKind) -> Result<Watcher, CacheError> {
        let watcher = self.factory.watcher_for(kind);
        if watcher.has_synced() {
            return Ok(watcher);
        }
        self.wait(&watcher).await?;
        Ok(watcher)
    }

    /// Synchronize every kind and return the registry of synced watchers.
    ///
    /// With `parallel` all pumps are started before the first wait, so the
    /// kinds list concurrently; otherwise each kind is fully synced before the
    /// next one is created. The first error aborts.
    pub async fn start_all(
        &self,
        kinds: &[ResourceKind],
        parallel: bool,
    ) -> Result<ResourceRegistry, CacheError> {
        let mut unique: Vec<ResourceKind> = kinds.to_vec();
        unique.sort();
        unique.dedup();

        let started = Instant::now();
        let mut synced = BTreeMap::new();
        if parallel {
            let watchers: Vec<Watcher> = unique
                .iter()
                .map(|kind| self.factory.watcher_for(*kind))
                .collect();
            self.factory.start();
            for watcher in watchers {
                if !watcher.has_synced() {
                    self.wait(&watcher).await?;
                }
                synced.insert(watcher.kind(), watcher);
            }
        } else {
            for kind in unique {
                synced.insert(kind, self.start(kind).await?);
            }
        }

        tracing::info!(
            kinds = synced.len(),
            parallel,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "all resource caches synced",
        );
        Ok(ResourceRegistry::from_synced(synced))
    }

    async fn wait(&self, watcher: &Watcher) -> Result<(), CacheError> {
        let kind = watcher.kind();
        let started = Instant::now();
        tracing::debug!(kind = %kind, timeout = ?self.timeout, "waiting for cache sync");
        wait_for_cache_sync(
            kind,
            self.timeout,
            self.factory.shutdown_token(),
            || self.factory.start(),
            || watcher.poll_sync(),
        )
        .await?;
        tracing::info!(
            kind = %kind,
            objects = watcher.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "watcher ready",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryControlPlane;
    use clusterlink_core::ObjectKey;
    use serde_json::json;

    fn manager(plane: &Arc<MemoryControlPlane>, timeout: Duration) -> SyncManager {
        SyncManager::new(plane.clone(), CancellationToken::new(), timeout)
    }

    #[tokio::test]
    async fn second_start_returns_same_watcher_without_relist() {
        let plane = Arc::new(MemoryControlPlane::new());
        plane.upsert(ResourceKind::Pod, ObjectKey::namespaced("default", "a"), json!({}));
        let manager = manager(&plane, Duration::from_secs(5));

        let first = manager.start(ResourceKind::Pod).await.expect("first start");
        let second = manager.start(ResourceKind::Pod).await.expect("second start");
        assert!(first.ptr_eq(&second));
        assert_eq!(plane.list_calls(ResourceKind::Pod), 1);
        manager.factory().shutdown_token().cancel();
    }

    #[tokio::test]
    async fn held_listing_times_out_and_later_start_succeeds() {
        let plane = Arc::new(MemoryControlPlane::new());
        plane.hold(ResourceKind::Node);
        let manager = manager(&plane, Duration::from_millis(200));

        let err = manager.start(ResourceKind::Node).await.unwrap_err();
        assert!(matches!(err, CacheError::SyncTimeout { kind: ResourceKind::Node, .. }));

        let watcher = manager.factory().watcher_for(ResourceKind::Node);
        assert!(watcher.is_started(), "watcher stays valid after a timeout");

        plane.release(ResourceKind::Node);
        let retried = manager.start(ResourceKind::Node).await.expect("retry");
        assert!(retried.ptr_eq(&watcher));
        assert!(retried.has_synced());
        manager.factory().shutdown_token().cancel();
    }

    #[tokio::test]
    async fn unavailable_control_plane_is_reported_not_retried() {
        let plane = Arc::new(MemoryControlPlane::new());
        plane.set_available(false);
        let manager = manager(&plane, Duration::from_secs(5));

        let err = manager.start(ResourceKind::Pod).await.unwrap_err();
        assert!(matches!(err, CacheError::ControlPlaneUnavailable { .. }), "got {err}");

        plane.set_available(true);
        let watcher = manager.start(ResourceKind::Pod).await.expect("recovered");
        assert!(watcher.has_synced());
        manager.factory().shutdown_token().cancel();
    }

    #[tokio::test]
    async fn start_all_sequential_and_parallel_agree() {
        for parallel in [false, true] {
            let plane = Arc::new(MemoryControlPlane::new());
            plane.upsert(ResourceKind::Namespace, ObjectKey::cluster("default"), json!({}));
            let manager = manager(&plane, Duration::from_secs(5));

            let registry = manager
                .start_all(
                    &[ResourceKind::Pod, ResourceKind::Namespace, ResourceKind::Pod],
                    parallel,
                )
                .await
                .expect("start_all");
            assert_eq!(
                registry.kinds(),
                vec![ResourceKind::Pod, ResourceKind::Namespace]
            );
            assert_eq!(registry.namespaces().len(), 1);
            manager.factory().shutdown_token().cancel();
        }
    }
}
