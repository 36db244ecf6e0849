//! Change notification hub: turns watcher cache mutations into pushed frames
//! for every observer subscribed to the mutated kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use clusterlink_cache::{EventHandler, Informer};
use clusterlink_core::{ResourceKind, Response, SessionId, WatchEvent};

type Observers = BTreeMap<SessionId, mpsc::Sender<Response>>;

/// How long a dropped observer's final notice may wait for queue space.
const DROP_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct NotificationHub {
    subscribers: DashMap<ResourceKind, Observers>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session` as an observer of `kind`. Resubscribing replaces the
    /// sender. Returns `true` when the session was not subscribed yet.
    pub fn subscribe(
        &self,
        session: SessionId,
        kind: ResourceKind,
        sender: mpsc::Sender<Response>,
    ) -> bool {
        let added = self
            .subscribers
            .entry(kind)
            .or_default()
            .insert(session, sender)
            .is_none();
        tracing::debug!(%session, kind = %kind, added, "observer subscribed");
        added
    }

    pub fn unsubscribe(&self, session: SessionId, kind: ResourceKind) -> bool {
        self.subscribers
            .get_mut(&kind)
            .map(|mut observers| observers.remove(&session).is_some())
            .unwrap_or(false)
    }

    /// Drop every subscription held by `session`. Returns how many were removed.
    pub fn disconnect(&self, session: SessionId) -> usize {
        let mut removed = 0;
        for mut observers in self.subscribers.iter_mut() {
            if observers.remove(&session).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn subscriber_count(&self, kind: ResourceKind) -> usize {
        self.subscribers
            .get(&kind)
            .map(|observers| observers.len())
            .unwrap_or(0)
    }

    /// Distinct sessions observing at least one kind.
    pub fn observers(&self) -> usize {
        self.subscribers
            .iter()
            .flat_map(|observers| observers.keys().copied().collect::<Vec<_>>())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Fan `event` out to the kind's observers. Delivery never waits: an
    /// observer whose queue is closed or full is dropped, and a full one is
    /// told so once its queue drains. Returns the number of observers reached.
    pub fn publish(&self, event: &WatchEvent) -> usize {
        let kind = event.kind();
        // Snapshot the senders so no map guard is held while sending or pruning.
        let targets: Vec<(SessionId, mpsc::Sender<Response>)> = match self.subscribers.get(&kind) {
            Some(observers) => observers
                .iter()
                .map(|(session, sender)| (*session, sender.clone()))
                .collect(),
            None => return 0,
        };
        if targets.is_empty() {
            return 0;
        }

        let notification = Response::notification(event);
        let mut delivered = 0;
        for (session, sender) in targets {
            match sender.try_send(notification.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        %session,
                        kind = %kind,
                        capacity = sender.max_capacity(),
                        "observer queue full, dropping observer",
                    );
                    if self.prune(kind, session, &sender) {
                        notify_dropped(session, kind, sender);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!(%session, kind = %kind, "observer disconnected, dropping observer");
                    self.prune(kind, session, &sender);
                }
            }
        }
        delivered
    }

    /// Remove the observer only if it still holds the sender that failed; a
    /// fresh subscription from the same session survives. Returns whether
    /// anything was removed.
    fn prune(
        &self,
        kind: ResourceKind,
        session: SessionId,
        failed: &mpsc::Sender<Response>,
    ) -> bool {
        let Some(mut observers) = self.subscribers.get_mut(&kind) else {
            return false;
        };
        let stale = observers
            .get(&session)
            .is_some_and(|current| current.same_channel(failed));
        if stale {
            observers.remove(&session);
        }
        stale
    }

    /// Mutation hook for one kind's watcher.
    pub fn hook(self: &Arc<Self>, kind: ResourceKind) -> Arc<dyn EventHandler> {
        let hub = Arc::clone(self);
        Arc::new(move |event: &WatchEvent| {
            if event.kind() == kind {
                hub.publish(event);
            }
        })
    }

    /// Install [`hook`](Self::hook) on `informer`.
    pub fn attach(self: &Arc<Self>, informer: &dyn Informer) {
        informer.subscribe(self.hook(informer.kind()));
    }
}

/// Queue a final error envelope behind the backlog of a dropped observer so
/// the client learns its subscription ended. Needs a runtime to wait on.
fn notify_dropped(session: SessionId, kind: ResourceKind, sender: mpsc::Sender<Response>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        let notice = Response::error(format!(
            "subscription to {kind} dropped: observer queue full"
        ));
        if let Err(err) = sender.send_timeout(notice, DROP_NOTICE_TIMEOUT).await {
            tracing::debug!(%session, kind = %kind, error = %err, "drop notice not delivered");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterlink_core::{CachedObject, EventType, ObjectKey};
    use serde_json::json;

    fn event(event_type: EventType, name: &str) -> WatchEvent {
        let object = CachedObject::new(
            ResourceKind::Pod,
            ObjectKey::namespaced("default", name),
            3,
            json!({"phase": "Running"}),
        );
        match event_type {
            EventType::Added => WatchEvent::added(object),
            EventType::Modified => WatchEvent::modified(object),
            EventType::Deleted => WatchEvent::deleted(object),
        }
    }

    #[test]
    fn every_subscriber_of_the_kind_receives_the_event() {
        let hub = NotificationHub::new();
        let (a_tx, mut a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        let (c_tx, mut c_rx) = mpsc::channel(4);
        hub.subscribe(SessionId(1), ResourceKind::Pod, a_tx);
        hub.subscribe(SessionId(2), ResourceKind::Pod, b_tx);
        hub.subscribe(SessionId(3), ResourceKind::Node, c_tx);

        assert_eq!(hub.publish(&event(EventType::Modified, "web")), 2);
        for rx in [&mut a_rx, &mut b_rx] {
            let pushed = rx.try_recv().expect("notification");
            assert_eq!(pushed.payload["event"], "modified");
            assert_eq!(pushed.payload["kind"], "pod");
            assert_eq!(pushed.payload["object"]["name"], "web");
        }
        assert!(c_rx.try_recv().is_err());
    }

    #[test]
    fn closed_observer_is_pruned_without_affecting_others() {
        let hub = NotificationHub::new();
        let (gone_tx, gone_rx) = mpsc::channel(4);
        let (live_tx, mut live_rx) = mpsc::channel(4);
        hub.subscribe(SessionId(1), ResourceKind::Pod, gone_tx);
        hub.subscribe(SessionId(2), ResourceKind::Pod, live_tx);
        drop(gone_rx);

        assert_eq!(hub.publish(&event(EventType::Deleted, "web")), 1);
        assert_eq!(hub.subscriber_count(ResourceKind::Pod), 1);
        assert_eq!(live_rx.try_recv().unwrap().payload["event"], "deleted");
    }

    #[test]
    fn full_queue_counts_as_failed_delivery() {
        let hub = NotificationHub::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        hub.subscribe(SessionId(5), ResourceKind::Pod, slow_tx);

        assert_eq!(hub.publish(&event(EventType::Added, "a")), 1);
        assert_eq!(hub.publish(&event(EventType::Added, "b")), 0);
        assert_eq!(hub.subscriber_count(ResourceKind::Pod), 0);
    }

    #[tokio::test]
    async fn dropped_observer_gets_a_final_notice_after_its_backlog() {
        let hub = NotificationHub::new();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        hub.subscribe(SessionId(7), ResourceKind::Pod, slow_tx);

        assert_eq!(hub.publish(&event(EventType::Added, "a")), 1);
        assert_eq!(hub.publish(&event(EventType::Added, "b")), 0);
        assert_eq!(hub.subscriber_count(ResourceKind::Pod), 0);

        let backlog = slow_rx.recv().await.expect("queued event");
        assert_eq!(backlog.payload["object"]["name"], "a");
        let notice = slow_rx.recv().await.expect("drop notice");
        assert_eq!(
            notice.error.as_deref(),
            Some("subscription to pod dropped: observer queue full")
        );

        // Later events no longer reach the dropped observer.
        assert_eq!(hub.publish(&event(EventType::Added, "c")), 0);
        assert!(slow_rx.try_recv().is_err());
    }

    #[test]
    fn resubscribed_session_survives_pruning_of_stale_sender() {
        let hub = NotificationHub::new();
        let (stale_tx, stale_rx) = mpsc::channel(4);
        hub.subscribe(SessionId(1), ResourceKind::Pod, stale_tx.clone());
        drop(stale_rx);
        let (fresh_tx, _fresh_rx) = mpsc::channel(4);
        hub.subscribe(SessionId(1), ResourceKind::Pod, fresh_tx);

        hub.prune(ResourceKind::Pod, SessionId(1), &stale_tx);
        assert_eq!(hub.subscriber_count(ResourceKind::Pod), 1);
    }

    #[test]
    fn disconnect_removes_all_subscriptions_of_a_session() {
        let hub = NotificationHub::new();
        let (tx, _rx) = mpsc::channel(4);
        hub.subscribe(SessionId(1), ResourceKind::Pod, tx.clone());
        hub.subscribe(SessionId(1), ResourceKind::Node, tx.clone());
        hub.subscribe(SessionId(2), ResourceKind::Node, tx);
        assert_eq!(hub.observers(), 2);

        assert_eq!(hub.disconnect(SessionId(1)), 2);
        assert_eq!(hub.subscriber_count(ResourceKind::Pod), 0);
        assert_eq!(hub.subscriber_count(ResourceKind::Node), 1);
        assert!(!hub.unsubscribe(SessionId(1), ResourceKind::Node));
        assert!(hub.unsubscribe(SessionId(2), ResourceKind::Node));
    }
}
