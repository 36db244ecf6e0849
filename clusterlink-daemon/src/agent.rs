//! Bootstrap: sync every configured kind, wire resource modules into the
//! dispatch table, and only then hand out the [`Agent`] that serves requests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use clusterlink_cache::{ListWatch, ResourceRegistry, SyncManager};
use clusterlink_core::{AgentConfig, ResourceKind, Response};

use crate::dispatch::{DispatchTable, DispatchTableBuilder};
use crate::error::DaemonError;
use crate::hub::NotificationHub;
use crate::resources::{CacheResource, PodResource};
use crate::workload::WorkloadOps;

/// Everything a connection needs, fully initialized.
pub struct Agent {
    registry: ResourceRegistry,
    hub: Arc<NotificationHub>,
    table: Arc<DispatchTable>,
    observer_queue: usize,
    started_at: DateTime<Utc>,
}

impl Agent {
    /// Block until every kind in `config.kinds` is synced, then build the
    /// frozen dispatch table. Any sync failure or duplicate registration
    /// aborts.
    pub async fn bootstrap(
        source: Arc<dyn ListWatch>,
        ops: Arc<dyn WorkloadOps>,
        config: &AgentConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, DaemonError> {
        let manager = SyncManager::from_config(source, shutdown, config);
        let registry = manager
            .start_all(&config.kinds, config.parallel_sync)
            .await?;

        let hub = Arc::new(NotificationHub::new());
        let mut builder = DispatchTableBuilder::new();
        for kind in registry.kinds() {
            let informer = registry.informer(kind);
            hub.attach(informer.as_ref());
            CacheResource::new(informer, Arc::clone(&hub)).register(&mut builder)?;
        }
        if registry.contains(ResourceKind::Pod) {
            PodResource::new(registry.informer(ResourceKind::Pod), ops).register(&mut builder)?;
        }
        let table = builder.build();

        tracing::info!(
            kinds = registry.kinds().len(),
            routes = table.len(),
            "agent ready",
        );
        Ok(Self {
            registry,
            hub,
            table,
            observer_queue: config.observer_queue,
            started_at: Utc::now(),
        })
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn table(&self) -> &Arc<DispatchTable> {
        &self.table
    }

    pub fn observer_queue(&self) -> usize {
        self.observer_queue
    }

    /// Requests addressed to the reserved `agent` kind. `stop` only
    /// acknowledges here; the connection triggers the shutdown.
    pub fn control(&self, action: &str) -> Response {
        match action {
            "status" => Response::ok(self.status()),
            "stop" => Response::ok(json!({ "stopping": true })),
            other => Response::unsupported(crate::protocol::AGENT_KIND, other),
        }
    }

    pub fn status(&self) -> Value {
        let kinds: Vec<Value> = self
            .registry
            .kinds()
            .into_iter()
            .map(|kind| {
                let watcher = self.registry.watcher(kind);
                json!({
                    "kind": kind,
                    "synced": watcher.has_synced(),
                    "objects": watcher.len(),
                    "resourceVersion": watcher.resource_version(),
                    "observers": self.hub.subscriber_count(kind),
                })
            })
            .collect();
        let routes: Vec<Value> = self
            .registry
            .kinds()
            .into_iter()
            .map(|kind| json!({ "kind": kind, "actions": self.table.actions_for(kind) }))
            .collect();
        let uptime = Utc::now().signed_duration_since(self.started_at);

        json!({
            "running": true,
            "startedAt": self.started_at,
            "uptimeSecs": uptime.num_seconds().max(0),
            "kinds": kinds,
            "routes": routes,
            "observers": self.hub.observers(),
        })
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("kinds", &self.registry.kinds())
            .field("routes", &self.table.len())
            .field("started_at", &self.started_at)
            .finish()
    }
}
