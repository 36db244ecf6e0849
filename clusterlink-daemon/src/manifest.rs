//! Manifest directory feed: mirrors `<dir>/<kind>/<name>.yaml` files into the
//! in-process control plane and keeps them in step with the filesystem.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use clusterlink_cache::MemoryControlPlane;
use clusterlink_core::{CachedObject, ObjectKey, ResourceKind};

use crate::error::{io_err, DaemonError};
use crate::paths::DEBOUNCE_WINDOW;

/// On-disk shape of one object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// Outcome of reconciling one manifest path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestChange {
    Applied(ResourceKind, ObjectKey),
    /// The object already matched the manifest; nothing was published.
    Unchanged(ResourceKind, ObjectKey),
    Deleted(ResourceKind, ObjectKey),
    Ignored,
}

/// Kind directory a manifest path belongs to, if it is a manifest at all.
pub fn manifest_kind(root: &Path, path: &Path) -> Option<ResourceKind> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let kind_dir = components.next()?.as_os_str().to_str()?;
    let file = components.next()?;
    if components.next().is_some() {
        return None;
    }
    let is_yaml = Path::new(file.as_os_str())
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);
    if !is_yaml {
        return None;
    }
    kind_dir.parse().ok()
}

pub fn read_manifest(kind: ResourceKind, path: &Path) -> Result<CachedObject, DaemonError> {
    let raw = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let manifest: Manifest = serde_yaml::from_str(&raw).map_err(|err| DaemonError::Manifest {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    if manifest.name.trim().is_empty() {
        return Err(DaemonError::Manifest {
            path: path.to_path_buf(),
            reason: "name must not be empty".to_string(),
        });
    }
    let key = match (kind.is_namespaced(), manifest.namespace) {
        (true, Some(namespace)) => ObjectKey::namespaced(namespace, manifest.name),
        (true, None) => ObjectKey::namespaced("default", manifest.name),
        (false, _) => ObjectKey::cluster(manifest.name),
    };
    Ok(CachedObject::new(kind, key, 0, manifest.body).with_labels(manifest.labels))
}

type ObjectId = (ResourceKind, ObjectKey);

pub struct ManifestFeed {
    root: PathBuf,
    plane: Arc<MemoryControlPlane>,
    applied: HashMap<PathBuf, ObjectId>,
    /// Every file currently declaring an object. The object lives as long as
    /// one of them does.
    owners: BTreeMap<ObjectId, BTreeSet<PathBuf>>,
}

impl ManifestFeed {
    /// Creates `root` when missing.
    pub fn new(root: &Path, plane: Arc<MemoryControlPlane>) -> Result<Self, DaemonError> {
        if !root.exists() {
            fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        }
        // Canonical so that watcher event paths match `strip_prefix`.
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        Ok(Self {
            root,
            plane,
            applied: HashMap::new(),
            owners: BTreeMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply every manifest currently on disk. Unreadable manifests are
    /// logged and skipped. Returns the number applied.
    pub fn load_all(&mut self) -> Result<usize, DaemonError> {
        let mut paths = Vec::new();
        let kind_dirs = fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))?;
        for entry in kind_dirs {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let files = fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?;
            for file in files {
                let file = file.map_err(|e| io_err(&dir, e))?;
                paths.push(file.path());
            }
        }
        paths.sort();

        let mut applied = 0;
        for path in paths {
            match self.apply_path(&path) {
                Ok(ManifestChange::Applied(..) | ManifestChange::Unchanged(..)) => applied += 1,
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "skipping manifest"),
            }
        }
        tracing::info!(root = %self.root.display(), manifests = applied, "manifests loaded");
        Ok(applied)
    }

    /// Bring the control plane in line with the current state of `path`.
    pub fn apply_path(&mut self, path: &Path) -> Result<ManifestChange, DaemonError> {
        let Some(kind) = manifest_kind(&self.root, path) else {
            return Ok(ManifestChange::Ignored);
        };

        let object = match read_manifest(kind, path) {
            Ok(object) => object,
            Err(DaemonError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return Ok(match self.applied.remove(path) {
                    Some(id) => self.release(path, id),
                    None => ManifestChange::Ignored,
                });
            }
            Err(err) => return Err(err),
        };

        let id = (kind, object.key.clone());
        if let Some(previous) = self.applied.insert(path.to_path_buf(), id.clone()) {
            if previous != id {
                self.release(path, previous);
            }
        }
        self.owners.entry(id).or_default().insert(path.to_path_buf());
        let change = self.publish(object);
        tracing::debug!(?change, path = %path.display(), "manifest applied");
        Ok(change)
    }

    /// Drop `path` as an owner of `id`. The object is deleted with its last
    /// owner; otherwise a remaining owner's content takes over.
    fn release(&mut self, path: &Path, id: ObjectId) -> ManifestChange {
        let (kind, key) = id.clone();
        let remaining = match self.owners.get_mut(&id) {
            Some(paths) => {
                paths.remove(path);
                paths.iter().next_back().cloned()
            }
            None => None,
        };

        let Some(owner) = remaining else {
            self.owners.remove(&id);
            self.plane.delete(kind, &key);
            tracing::info!(kind = %kind, key = %key, "manifest removed");
            return ManifestChange::Deleted(kind, key);
        };
        match read_manifest(kind, &owner) {
            Ok(object) if object.key == key => {
                tracing::info!(
                    kind = %kind,
                    key = %key,
                    owner = %owner.display(),
                    "manifest removed, object still declared elsewhere"
                );
                self.publish(object)
            }
            Ok(_) | Err(_) => {
                // The other file changed under us; its own event re-applies it.
                tracing::debug!(kind = %kind, key = %key, owner = %owner.display(), "owner not re-read");
                ManifestChange::Unchanged(kind, key)
            }
        }
    }

    /// Upsert `object` unless the plane already holds the same content.
    fn publish(&self, object: CachedObject) -> ManifestChange {
        let kind = object.kind;
        let key = object.key.clone();
        if let Some(current) = self.plane.get(kind, &key) {
            if current.body == object.body && current.labels == object.labels {
                return ManifestChange::Unchanged(kind, key);
            }
        }
        self.plane.upsert_object(object);
        ManifestChange::Applied(kind, key)
    }

    /// Watch the directory until shutdown. Changes to a path are applied once
    /// it has been quiet for [`DEBOUNCE_WINDOW`].
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        tracing::debug!(root = %self.root.display(), "watching manifest directory");

        let mut pending = HashMap::<PathBuf, Instant>::new();
        let mut ticker = tokio::time::interval(DEBOUNCE_WINDOW / 4);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let event = match event {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::warn!(error = %err, "manifest watcher event error");
                            continue;
                        }
                    };
                    if !is_relevant_event_kind(&event.kind) {
                        continue;
                    }
                    for path in event.paths {
                        if manifest_kind(&self.root, &path).is_some() {
                            pending.insert(path, Instant::now());
                        }
                    }
                }
                _ = ticker.tick() => {
                    for path in take_settled(&mut pending, Instant::now(), DEBOUNCE_WINDOW) {
                        if let Err(err) = self.apply_path(&path) {
                            tracing::warn!(error = %err, "manifest change not applied");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Remove and return the paths whose last change is at least `window` old.
fn take_settled(
    pending: &mut HashMap<PathBuf, Instant>,
    now: Instant,
    window: Duration,
) -> Vec<PathBuf> {
    let mut settled: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, changed_at)| now.duration_since(**changed_at) >= window)
        .map(|(path, _)| path.clone())
        .collect();
    for path in &settled {
        pending.remove(path);
    }
    settled.sort();
    settled
}
