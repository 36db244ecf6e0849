use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use clusterlink_cache::{Informer, MemoryControlPlane, SyncManager};
use clusterlink_core::{EventType, ObjectKey, ResourceKind, WatchEvent};

async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn registry_informer_tracks_control_plane_mutations() {
    let plane = Arc::new(MemoryControlPlane::new());
    let web = ObjectKey::namespaced("default", "web");
    plane.upsert(ResourceKind::Pod, web.clone(), json!({ "image": "nginx:1" }));
    plane.upsert(ResourceKind::Namespace, ObjectKey::cluster("default"), json!({}));

    let shutdown = CancellationToken::new();
    let manager = SyncManager::new(plane.clone(), shutdown.clone(), Duration::from_secs(5));
    let registry = manager
        .start_all(&[ResourceKind::Pod, ResourceKind::Namespace], true)
        .await
        .expect("bootstrap");
    assert!(registry.pods().has_synced());
    assert!(registry.namespaces().has_synced());
    assert_eq!(registry.kinds(), vec![ResourceKind::Pod, ResourceKind::Namespace]);

    let informer = registry.informer(ResourceKind::Pod);
    let seen: Arc<Mutex<Vec<WatchEvent>>> = Arc::default();
    let sink = seen.clone();
    informer.subscribe(Arc::new(move |event: &WatchEvent| {
        sink.lock().unwrap().push(event.clone());
    }));

    plane.upsert(ResourceKind::Pod, web.clone(), json!({ "image": "nginx:2" }));
    until(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(
        informer.get_by_key(&web).expect("cached").body["image"],
        json!("nginx:2")
    );

    plane.delete(ResourceKind::Pod, &web).expect("existing pod");
    until(|| seen.lock().unwrap().len() == 2).await;
    assert!(informer.get_by_key(&web).is_none());

    let types: Vec<EventType> = seen.lock().unwrap().iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::Modified, EventType::Deleted]);

    shutdown.cancel();
}

#[tokio::test]
#[should_panic(expected = "was never synchronized")]
async fn registry_panics_for_unsynchronized_kind() {
    let plane = Arc::new(MemoryControlPlane::new());
    let manager = SyncManager::new(plane, CancellationToken::new(), Duration::from_secs(5));
    let registry = manager
        .start_all(&[ResourceKind::Pod], false)
        .await
        .expect("bootstrap");
    let _ = registry.nodes();
}
