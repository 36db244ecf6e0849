//! In-process control plane.
//!
//! Holds objects per kind, assigns monotonically increasing resource versions
//! and serves [`ListWatch`] from a bounded event history plus a live broadcast
//! feed. The daemon feeds it from manifests on disk; tests drive it directly
//! and use the fault knobs (`set_available`, `hold`, `break_watches`).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use clusterlink_core::{CachedObject, ObjectKey, ResourceKind, WatchEvent};

use crate::error::SourceError;
use crate::source::{ListSnapshot, ListWatch, WatchStream};

/// Watch events retained for watches opened at an older resource version.
pub const HISTORY_LIMIT: usize = 1024;
const FEED_CAPACITY: usize = 1024;
const LOG_CAPACITY: usize = 256;

/// One line of workload output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub key: ObjectKey,
    pub container: Option<String>,
    pub line: String,
}

#[derive(Debug, Clone)]
enum Feed {
    Event(WatchEvent),
    Break,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceKind, BTreeMap<ObjectKey, Arc<CachedObject>>>,
    resource_version: u64,
    history: VecDeque<WatchEvent>,
    compacted: u64,
    offline: bool,
    held: HashSet<ResourceKind>,
    list_calls: HashMap<ResourceKind, usize>,
    logs: HashMap<ObjectKey, Vec<LogLine>>,
}

pub struct MemoryControlPlane {
    state: Mutex<State>,
    feed: broadcast::Sender<Feed>,
    log_feed: broadcast::Sender<LogLine>,
    released: Notify,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let (log_feed, _) = broadcast::channel(LOG_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            feed,
            log_feed,
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace an object. Returns the stored snapshot.
    pub fn upsert(&self, kind: ResourceKind, key: ObjectKey, body: Value) -> Arc<CachedObject> {
        self.upsert_object(CachedObject::new(kind, key, 0, body))
    }

    /// Store `object` under a fresh resource version. The version and
    /// observation time on the argument are overwritten.
    pub fn upsert_object(&self, mut object: CachedObject) -> Arc<CachedObject> {
        let mut state = self.lock();
        state.resource_version += 1;
        object.resource_version = state.resource_version;
        object.observed_at = chrono::Utc::now();
        let object = Arc::new(object);

        let previous = state
            .objects
            .entry(object.kind)
            .or_default()
            .insert(object.key.clone(), Arc::clone(&object));
        let event = match previous {
            None => WatchEvent::added(Arc::clone(&object)),
            Some(_) => WatchEvent::modified(Arc::clone(&object)),
        };
        self.commit(&mut state, event);
        object
    }

    /// Remove an object and emit a `deleted` event carrying its last state.
    pub fn delete(&self, kind: ResourceKind, key: &ObjectKey) -> Option<Arc<CachedObject>> {
        let mut state = self.lock();
        let previous = state.objects.get_mut(&kind)?.remove(key)?;
        state.resource_version += 1;
        let mut gone = (*previous).clone();
        gone.resource_version = state.resource_version;
        gone.observed_at = chrono::Utc::now();
        let gone = Arc::new(gone);
        self.commit(&mut state, WatchEvent::deleted(Arc::clone(&gone)));
        Some(gone)
    }

    /// Remove an object without emitting a watch event, as if the event was
    /// lost in transit. Only a relist will notice.
    pub fn delete_silently(&self, kind: ResourceKind, key: &ObjectKey) -> bool {
        let mut state = self.lock();
        let removed = state
            .objects
            .get_mut(&kind)
            .and_then(|objects| objects.remove(key))
            .is_some();
        if removed {
            state.resource_version += 1;
        }
        removed
    }

    pub fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Option<Arc<CachedObject>> {
        self.lock()
            .objects
            .get(&kind)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<Arc<CachedObject>> {
        self.lock()
            .objects
            .get(&kind)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn resource_version(&self) -> u64 {
        self.lock().resource_version
    }

    /// Number of `list` calls received for `kind`.
    pub fn list_calls(&self, kind: ResourceKind) -> usize {
        self.lock().list_calls.get(&kind).copied().unwrap_or(0)
    }

    /// Going offline fails every list/watch call and ends open watches.
    pub fn set_available(&self, available: bool) {
        self.lock().offline = !available;
        if !available {
            let _ = self.feed.send(Feed::Break);
        }
    }

    /// Make `list(kind)` wait until [`release`](Self::release).
    pub fn hold(&self, kind: ResourceKind) {
        self.lock().held.insert(kind);
    }

    pub fn release(&self, kind: ResourceKind) {
        self.lock().held.remove(&kind);
        self.released.notify_waiters();
    }

    /// Number of watch streams currently open.
    pub fn watch_count(&self) -> usize {
        self.feed.receiver_count()
    }

    /// End every open watch stream; watchers will relist.
    pub fn break_watches(&self) {
        let _ = self.feed.send(Feed::Break);
    }

    pub fn append_log(&self, key: &ObjectKey, container: Option<&str>, line: impl Into<String>) {
        let entry = LogLine {
            key: key.clone(),
            container: container.map(str::to_owned),
            line: line.into(),
        };
        let mut state = self.lock();
        state.logs.entry(key.clone()).or_default().push(entry.clone());
        let _ = self.log_feed.send(entry);
    }

    /// Lines written so far for `key` plus a receiver for every later line
    /// (of every workload; callers filter).
    pub fn tail_logs(&self, key: &ObjectKey) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        let state = self.lock();
        let existing = state.logs.get(key).cloned().unwrap_or_default();
        (existing, self.log_feed.subscribe())
    }

    fn commit(&self, state: &mut State, event: WatchEvent) {
        tracing::trace!(
            kind = %event.kind(),
            key = %event.object.key,
            event = %event.event_type,
            resource_version = event.object.resource_version,
            "control plane mutation",
        );
        state.history.push_back(event.clone());
        while state.history.len() > HISTORY_LIMIT {
            if let Some(evicted) = state.history.pop_front() {
                state.compacted = evicted.object.resource_version;
            }
        }
        let _ = self.feed.send(Feed::Event(event));
    }
}

#[async_trait]
impl ListWatch for MemoryControlPlane {
    async fn list(&self, kind: ResourceKind) -> Result<ListSnapshot, SourceError> {
        *self.lock().list_calls.entry(kind).or_default() += 1;
        loop {
            let released = self.released.notified();
            {
                let state = self.lock();
                if state.offline {
                    return Err(SourceError::Unavailable(
                        "memory control plane is offline".to_string(),
                    ));
                }
                if !state.held.contains(&kind) {
                    let objects = state
                        .objects
                        .get(&kind)
                        .map(|objects| objects.values().map(|o| (**o).clone()).collect())
                        .unwrap_or_default();
                    return Ok(ListSnapshot {
                        resource_version: state.resource_version,
                        objects,
                    });
                }
            }
            released.await;
        }
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: u64,
    ) -> Result<WatchStream, SourceError> {
        let (backlog, receiver) = {
            let state = self.lock();
            if state.offline {
                return Err(SourceError::Unavailable(
                    "memory control plane is offline".to_string(),
                ));
            }
            if resource_version < state.compacted {
                return Err(SourceError::Expired(resource_version));
            }
            // Subscribe while holding the lock: commits also send under it,
            // so nothing falls between the backlog and the live feed.
            let receiver = self.feed.subscribe();
            let backlog: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|e| e.kind() == kind && e.object.resource_version > resource_version)
                .cloned()
                .collect();
            (backlog, receiver)
        };

        let live = BroadcastStream::new(receiver).filter_map(move |feed| match feed {
            Ok(Feed::Event(event))
                if event.kind() == kind && event.object.resource_version > resource_version =>
            {
                Some(Ok(event))
            }
            Ok(Feed::Event(_)) => None,
            Ok(Feed::Break) => Some(Err(SourceError::Unavailable(
                "watch closed by control plane".to_string(),
            ))),
            Err(BroadcastStreamRecvError::Lagged(_)) => {
                Some(Err(SourceError::Expired(resource_version)))
            }
        });
        Ok(Box::pin(
            tokio_stream::iter(backlog.into_iter().map(Ok)).chain(live),
        ))
    }
}

impl std::fmt::Debug for MemoryControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryControlPlane")
            .field("resource_version", &state.resource_version)
            .field("kinds", &state.objects.len())
            .field("offline", &state.offline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterlink_core::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn list_reports_current_version_and_objects() {
        let plane = MemoryControlPlane::new();
        plane.upsert(ResourceKind::Pod, ObjectKey::namespaced("a", "x"), json!({}));
        plane.upsert(ResourceKind::Node, ObjectKey::cluster("n"), json!({}));

        let snapshot = plane.list(ResourceKind::Pod).await.expect("list");
        assert_eq!(snapshot.resource_version, 2);
        assert_eq!(snapshot.objects.len(), 1);
        assert_eq!(plane.list_calls(ResourceKind::Pod), 1);
    }

    #[tokio::test]
    async fn watch_replays_backlog_then_follows_live_feed() {
        let plane = MemoryControlPlane::new();
        let key = ObjectKey::namespaced("default", "web");
        plane.upsert(ResourceKind::Pod, key.clone(), json!({"v": 1}));
        plane.upsert(ResourceKind::Node, ObjectKey::cluster("n"), json!({}));

        let mut stream = plane.watch(ResourceKind::Pod, 0).await.expect("watch");
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event_type, EventType::Added);

        plane.delete(ResourceKind::Pod, &key);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.event_type, EventType::Deleted);
        assert_eq!(second.object.resource_version, 3);
    }

    #[tokio::test]
    async fn break_ends_watch_with_error() {
        let plane = MemoryControlPlane::new();
        let mut stream = plane.watch(ResourceKind::Pod, 0).await.expect("watch");
        plane.break_watches();
        assert!(stream.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn offline_plane_refuses_list() {
        let plane = MemoryControlPlane::new();
        plane.set_available(false);
        let err = plane.list(ResourceKind::Pod).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[test]
    fn held_list_stays_pending_until_released() {
        let plane = MemoryControlPlane::new();
        plane.upsert(ResourceKind::Node, ObjectKey::cluster("n"), json!({}));
        plane.hold(ResourceKind::Node);

        let mut list = tokio_test::task::spawn(plane.list(ResourceKind::Node));
        tokio_test::assert_pending!(list.poll());

        plane.release(ResourceKind::Node);
        assert!(list.is_woken());
        let snapshot = tokio_test::assert_ready_ok!(list.poll());
        assert_eq!(snapshot.objects.len(), 1);
    }

    #[test]
    fn tail_logs_returns_existing_lines() {
        let plane = MemoryControlPlane::new();
        let key = ObjectKey::namespaced("default", "web");
        plane.append_log(&key, Some("app"), "listening on :8080");
        let (lines, _rx) = plane.tail_logs(&key);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].container.as_deref(), Some("app"));
    }
}
