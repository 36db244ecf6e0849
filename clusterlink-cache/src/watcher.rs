//! Per-kind list-then-watch cache.
//!
//! The event pump is the only writer to the cache: it lists, marks the cache
//! synced, follows the watch stream from the listed resource version and
//! relists (emitting the difference) whenever the stream breaks.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use clusterlink_core::{CachedObject, EventType, ObjectKey, ResourceKind, WatchEvent};

use crate::error::SourceError;
use crate::informer::{EventHandler, Informer};
use crate::source::{ListSnapshot, ListWatch};
use crate::sync::SyncPoll;

/// Relist backoff after a failed list or a broken watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Lifecycle of a watcher. `Synced` is terminal for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Uninitialized,
    Syncing,
    Synced,
}

/// Cheaply cloneable handle to one kind's cache.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<Inner>,
}

struct Inner {
    kind: ResourceKind,
    source: Arc<dyn ListWatch>,
    backoff: Backoff,
    cache: DashMap<ObjectKey, Arc<CachedObject>>,
    started: AtomicBool,
    synced: AtomicBool,
    resource_version: AtomicU64,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    list_error: Mutex<Option<SourceError>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .field("objects", &self.len())
            .finish()
    }
}

impl Watcher {
    pub fn new(kind: ResourceKind, source: Arc<dyn ListWatch>, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                source,
                backoff,
                cache: DashMap::new(),
                started: AtomicBool::new(false),
                synced: AtomicBool::new(false),
                resource_version: AtomicU64::new(0),
                handlers: RwLock::new(Vec::new()),
                list_error: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    pub fn state(&self) -> WatcherState {
        if self.inner.synced.load(Ordering::Acquire) {
            WatcherState::Synced
        } else if self.inner.started.load(Ordering::Acquire) {
            WatcherState::Syncing
        } else {
            WatcherState::Uninitialized
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cache.is_empty()
    }

    /// Highest resource version applied to the cache.
    pub fn resource_version(&self) -> u64 {
        self.inner.resource_version.load(Ordering::Acquire)
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<CachedObject>> {
        self.inner.cache.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<Arc<CachedObject>> {
        let mut objects: Vec<_> = self
            .inner
            .cache
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Two handles refer to the same cache.
    pub fn ptr_eq(&self, other: &Watcher) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Spawn the event pump on the current tokio runtime. Only the first call
    /// has an effect.
    pub fn start(&self, shutdown: &CancellationToken) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(kind = %self.inner.kind, "starting watcher event pump");
        let inner = Arc::clone(&self.inner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { inner.run(shutdown).await });
    }

    /// Sync progress as seen by [`wait_for_cache_sync`](crate::wait_for_cache_sync).
    /// A pending list failure is consumed by this call.
    pub fn poll_sync(&self) -> SyncPoll {
        if self.has_synced() {
            return SyncPoll::Synced;
        }
        match self
            .inner
            .list_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(err) => SyncPoll::Failed(err),
            None => SyncPoll::Pending,
        }
    }
}

impl Informer for Watcher {
    fn kind(&self) -> ResourceKind {
        Watcher::kind(self)
    }

    fn start(&self, shutdown: &CancellationToken) {
        Watcher::start(self, shutdown)
    }

    fn has_synced(&self) -> bool {
        Watcher::has_synced(self)
    }

    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<CachedObject>> {
        Watcher::get_by_key(self, key)
    }

    fn list(&self) -> Vec<Arc<CachedObject>> {
        Watcher::list(self)
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        Watcher::subscribe(self, handler)
    }
}

impl Inner {
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut delay = self.backoff.initial;
        loop {
            let listed = tokio::select! {
                _ = shutdown.cancelled() => break,
                listed = self.source.list(self.kind) => listed,
            };
            match listed {
                Ok(snapshot) => {
                    self.replace(snapshot);
                    delay = self.backoff.initial;
                    if !self.follow(&shutdown).await {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(kind = %self.kind, error = %err, "list failed");
                    if !self.synced.load(Ordering::Acquire) {
                        *self
                            .list_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(err);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.backoff.next(delay);
        }
        tracing::debug!(kind = %self.kind, "watcher event pump stopped");
    }

    /// Follow the watch stream. Returns `false` when shutdown was requested,
    /// `true` when the caller should relist.
    async fn follow(&self, shutdown: &CancellationToken) -> bool {
        let since = self.resource_version.load(Ordering::Acquire);
        let opened = tokio::select! {
            _ = shutdown.cancelled() => return false,
            opened = self.source.watch(self.kind, since) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(kind = %self.kind, error = %err, "watch could not be opened");
                return true;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(err)) => {
                        tracing::warn!(kind = %self.kind, error = %err, "watch stream broke, relisting");
                        return true;
                    }
                    None => {
                        tracing::debug!(kind = %self.kind, "watch stream closed, relisting");
                        return true;
                    }
                }
            }
        }
    }

    /// Replace the cache with a fresh listing, emitting the difference.
    fn replace(&self, snapshot: ListSnapshot) {
        let mut listed = HashSet::with_capacity(snapshot.objects.len());
        let mut events = Vec::new();

        for object in snapshot.objects {
            if object.kind != self.kind {
                continue;
            }
            let object = Arc::new(object);
            listed.insert(object.key.clone());
            match self.cache.insert(object.key.clone(), Arc::clone(&object)) {
                None => events.push(WatchEvent::added(object)),
                Some(previous) if previous.resource_version != object.resource_version => {
                    events.push(WatchEvent::modified(object))
                }
                Some(_) => {}
            }
        }

        let vanished: Vec<ObjectKey> = self
            .cache
            .iter()
            .filter(|entry| !listed.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in vanished {
            if let Some((_, previous)) = self.cache.remove(&key) {
                events.push(WatchEvent::deleted(previous));
            }
        }

        self.resource_version
            .fetch_max(snapshot.resource_version, Ordering::AcqRel);

        let first_sync = !self.synced.swap(true, Ordering::AcqRel);
        self.list_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if first_sync {
            tracing::info!(
                kind = %self.kind,
                objects = self.cache.len(),
                resource_version = snapshot.resource_version,
                "cache synced",
            );
        } else {
            tracing::debug!(kind = %self.kind, changes = events.len(), "relist applied");
        }

        for event in &events {
            self.notify(event);
        }
    }

    fn apply(&self, event: WatchEvent) {
        if event.kind() != self.kind {
            tracing::warn!(
                kind = %self.kind,
                got = %event.kind(),
                "dropping watch event for another kind",
            );
            return;
        }
        let version = event.object.resource_version;
        if version <= self.resource_version.load(Ordering::Acquire) {
            tracing::trace!(kind = %self.kind, version, "skipping already applied event");
            return;
        }

        let key = event.object.key.clone();
        match event.event_type {
            EventType::Added | EventType::Modified => {
                self.cache.insert(key, Arc::clone(&event.object));
            }
            EventType::Deleted => {
                self.cache.remove(&key);
            }
        }
        self.resource_version.fetch_max(version, Ordering::AcqRel);
        self.notify(&event);
    }

    fn notify(&self, event: &WatchEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryControlPlane;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn watcher_on(plane: &Arc<MemoryControlPlane>, kind: ResourceKind) -> Watcher {
        let source: Arc<dyn ListWatch> = plane.clone();
        Watcher::new(kind, source, Backoff::default())
    }

    async fn until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn initial_list_populates_cache_and_marks_synced() {
        let plane = Arc::new(MemoryControlPlane::new());
        plane.upsert(ResourceKind::Pod, ObjectKey::namespaced("default", "a"), json!({}));
        plane.upsert(ResourceKind::Pod, ObjectKey::namespaced("default", "b"), json!({}));
        plane.upsert(ResourceKind::Node, ObjectKey::cluster("n1"), json!({}));

        let watcher = watcher_on(&plane, ResourceKind::Pod);
        assert_eq!(watcher.state(), WatcherState::Uninitialized);

        let shutdown = CancellationToken::new();
        watcher.start(&shutdown);
        until(|| watcher.has_synced()).await;

        assert_eq!(watcher.state(), WatcherState::Synced);
        assert_eq!(watcher.len(), 2);
        let names: Vec<_> = watcher.list().iter().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn watch_events_update_cache_and_reach_handlers() {
        let plane = Arc::new(MemoryControlPlane::new());
        let watcher = watcher_on(&plane, ResourceKind::ConfigMap);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        watcher.subscribe(Arc::new(move |event: &WatchEvent| {
            sink.lock().unwrap().push((event.event_type, event.object.name().to_string()));
        }));

        let shutdown = CancellationToken::new();
        watcher.start(&shutdown);
        until(|| watcher.has_synced()).await;

        let key = ObjectKey::namespaced("kube-system", "coredns");
        plane.upsert(ResourceKind::ConfigMap, key.clone(), json!({"v": 1}));
        plane.upsert(ResourceKind::ConfigMap, key.clone(), json!({"v": 2}));
        until(|| seen.lock().unwrap().len() == 2).await;
        assert_eq!(watcher.get_by_key(&key).unwrap().body, json!({"v": 2}));

        plane.delete(ResourceKind::ConfigMap, &key);
        until(|| seen.lock().unwrap().len() == 3).await;
        assert!(watcher.get_by_key(&key).is_none());

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec![EventType::Added, EventType::Modified, EventType::Deleted]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let plane = Arc::new(MemoryControlPlane::new());
        let watcher = watcher_on(&plane, ResourceKind::Namespace);
        let shutdown = CancellationToken::new();
        watcher.start(&shutdown);
        watcher.start(&shutdown);
        until(|| watcher.has_synced()).await;
        assert_eq!(plane.list_calls(ResourceKind::Namespace), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn list_failure_is_reported_once_then_pending() {
        let plane = Arc::new(MemoryControlPlane::new());
        plane.set_available(false);
        let watcher = watcher_on(&plane, ResourceKind::Pod);
        let shutdown = CancellationToken::new();
        watcher.start(&shutdown);

        until(|| plane.list_calls(ResourceKind::Pod) >= 1).await;
        until(|| matches!(watcher.poll_sync(), SyncPoll::Failed(_)) || watcher.has_synced())
            .await;
        assert!(!watcher.has_synced());
        assert!(matches!(watcher.poll_sync(), SyncPoll::Pending));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn broken_watch_relists_and_emits_missed_deletion() {
        let plane = Arc::new(MemoryControlPlane::new());
        let key = ObjectKey::namespaced("default", "web-0");
        plane.upsert(ResourceKind::Pod, key.clone(), json!({}));

        let watcher = Watcher::new(
            ResourceKind::Pod,
            plane.clone(),
            Backoff {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
            },
        );
        let deletions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deletions);
        watcher.subscribe(Arc::new(move |event: &WatchEvent| {
            if event.event_type == EventType::Deleted {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let shutdown = CancellationToken::new();
        watcher.start(&shutdown);
        until(|| watcher.has_synced() && plane.watch_count() == 1).await;

        // Delete while every watch is being torn down; the relist must notice.
        plane.delete_silently(ResourceKind::Pod, &key);
        plane.break_watches();

        until(|| deletions.load(Ordering::SeqCst) == 1).await;
        assert!(watcher.get_by_key(&key).is_none());
        assert!(watcher.has_synced(), "synced never reverts");
        shutdown.cancel();
    }
}
