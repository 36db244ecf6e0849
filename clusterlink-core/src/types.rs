//! Domain types shared by the cache, the dispatch router and the transport.
//!
//! Wire names are stable: kinds serialize camelCase (`configMap`), actions
//! kebab-case (`open-log`). Parsing is more lenient than serialization so that
//! CLI users and older clients can use plurals and short names.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Returned when a kind, action or object key string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} '{value}'")]
pub struct ParseNameError {
    pub what: &'static str,
    pub value: String,
}

impl ParseNameError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource kinds
// ---------------------------------------------------------------------------

/// A class of cluster object mirrored by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Pod,
    Namespace,
    Node,
    ConfigMap,
    Deployment,
    StatefulSet,
    DaemonSet,
    Event,
    PersistentVolume,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Pod,
        ResourceKind::Namespace,
        ResourceKind::Node,
        ResourceKind::ConfigMap,
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
        ResourceKind::DaemonSet,
        ResourceKind::Event,
        ResourceKind::PersistentVolume,
    ];

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Namespace => "namespace",
            ResourceKind::Node => "node",
            ResourceKind::ConfigMap => "configMap",
            ResourceKind::Deployment => "deployment",
            ResourceKind::StatefulSet => "statefulSet",
            ResourceKind::DaemonSet => "daemonSet",
            ResourceKind::Event => "event",
            ResourceKind::PersistentVolume => "persistentVolume",
        }
    }

    /// Cluster-scoped kinds have no namespace in their [`ObjectKey`].
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            ResourceKind::Namespace | ResourceKind::Node | ResourceKind::PersistentVolume
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            "namespace" | "namespaces" | "ns" => Ok(ResourceKind::Namespace),
            "node" | "nodes" | "no" => Ok(ResourceKind::Node),
            "configmap" | "configmaps" | "cm" => Ok(ResourceKind::ConfigMap),
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(ResourceKind::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Ok(ResourceKind::DaemonSet),
            "event" | "events" | "ev" => Ok(ResourceKind::Event),
            "persistentvolume" | "persistentvolumes" | "pv" => Ok(ResourceKind::PersistentVolume),
            _ => Err(ParseNameError::new("resource kind", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// An operation class a resource module may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionName {
    List,
    Get,
    Delete,
    Update,
    Exec,
    Stdin,
    #[serde(alias = "openLog")]
    OpenLog,
    #[serde(alias = "closeLog")]
    CloseLog,
    #[serde(alias = "watchSubscribe")]
    WatchSubscribe,
}

impl ActionName {
    pub const ALL: [ActionName; 9] = [
        ActionName::List,
        ActionName::Get,
        ActionName::Delete,
        ActionName::Update,
        ActionName::Exec,
        ActionName::Stdin,
        ActionName::OpenLog,
        ActionName::CloseLog,
        ActionName::WatchSubscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionName::List => "list",
            ActionName::Get => "get",
            ActionName::Delete => "delete",
            ActionName::Update => "update",
            ActionName::Exec => "exec",
            ActionName::Stdin => "stdin",
            ActionName::OpenLog => "open-log",
            ActionName::CloseLog => "close-log",
            ActionName::WatchSubscribe => "watch-subscribe",
        }
    }

    /// Actions that keep pushing frames to the caller after the first reply.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            ActionName::WatchSubscribe | ActionName::Exec | ActionName::Stdin | ActionName::OpenLog
        )
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionName {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "list" => Ok(ActionName::List),
            "get" => Ok(ActionName::Get),
            "delete" => Ok(ActionName::Delete),
            "update" => Ok(ActionName::Update),
            "exec" => Ok(ActionName::Exec),
            "stdin" => Ok(ActionName::Stdin),
            "openlog" => Ok(ActionName::OpenLog),
            "closelog" => Ok(ActionName::CloseLog),
            "watchsubscribe" | "watch" => Ok(ActionName::WatchSubscribe),
            _ => Err(ParseNameError::new("action", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// Object identity and snapshots
// ---------------------------------------------------------------------------

/// Cache key of an object: namespace (absent for cluster-scoped kinds) + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() => ObjectKey::namespaced(ns, name),
            Some((_, name)) => ObjectKey::cluster(name),
            None => ObjectKey::cluster(s),
        };
        if key.name.is_empty() || key.name.contains('/') {
            return Err(ParseNameError::new("object key", s));
        }
        Ok(key)
    }
}

/// Read-only snapshot of a control-plane object as held by a watcher cache.
///
/// Shared as `Arc<CachedObject>`; a newer version replaces the `Arc`, the
/// snapshot itself is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedObject {
    pub kind: ResourceKind,
    #[serde(flatten)]
    pub key: ObjectKey,
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    pub observed_at: DateTime<Utc>,
}

impl CachedObject {
    pub fn new(kind: ResourceKind, key: ObjectKey, resource_version: u64, body: Value) -> Self {
        Self {
            kind,
            key,
            resource_version,
            labels: BTreeMap::new(),
            body,
            observed_at: Utc::now(),
        }
    }

    pub fn with_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.key.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Equality-based selector: every selector pair must be present.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Mutation observed on a watcher cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => write!(f, "added"),
            EventType::Modified => write!(f, "modified"),
            EventType::Deleted => write!(f, "deleted"),
        }
    }
}

/// One cache mutation together with the affected snapshot. For deletions the
/// snapshot is the last known state of the object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: Arc<CachedObject>,
}

impl WatchEvent {
    pub fn added(object: impl Into<Arc<CachedObject>>) -> Self {
        Self {
            event_type: EventType::Added,
            object: object.into(),
        }
    }

    pub fn modified(object: impl Into<Arc<CachedObject>>) -> Self {
        Self {
            event_type: EventType::Modified,
            object: object.into(),
        }
    }

    pub fn deleted(object: impl Into<Arc<CachedObject>>) -> Self {
        Self {
            event_type: EventType::Deleted,
            object: object.into(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.object.kind
    }
}

/// Identifies one transport connection and therefore one observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_wire_names_are_camel_case() {
        assert_eq!(ResourceKind::ConfigMap.to_string(), "configMap");
        assert_eq!(
            serde_json::to_value(ResourceKind::PersistentVolume).unwrap(),
            json!("persistentVolume")
        );
    }

    #[test]
    fn kind_parse_accepts_short_names_and_plurals() {
        assert_eq!("pods".parse::<ResourceKind>().unwrap(), ResourceKind::Pod);
        assert_eq!("cm".parse::<ResourceKind>().unwrap(), ResourceKind::ConfigMap);
        assert_eq!(
            "stateful-set".parse::<ResourceKind>().unwrap(),
            ResourceKind::StatefulSet
        );
        assert_eq!(
            "configMap".parse::<ResourceKind>().unwrap(),
            ResourceKind::ConfigMap
        );
        let err = "widget".parse::<ResourceKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown resource kind 'widget'");
    }

    #[test]
    fn every_kind_roundtrips_through_its_wire_name() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        for action in ActionName::ALL {
            assert_eq!(action.as_str().parse::<ActionName>().unwrap(), action);
        }
    }

    #[test]
    fn action_parse_accepts_camel_case_aliases() {
        assert_eq!("openLog".parse::<ActionName>().unwrap(), ActionName::OpenLog);
        assert_eq!(
            "watch".parse::<ActionName>().unwrap(),
            ActionName::WatchSubscribe
        );
        assert!("restart".parse::<ActionName>().is_err());
        let decoded: ActionName = serde_json::from_value(json!("closeLog")).unwrap();
        assert_eq!(decoded, ActionName::CloseLog);
    }

    #[test]
    fn object_key_display_and_parse() {
        let key: ObjectKey = "default/web-0".parse().unwrap();
        assert_eq!(key, ObjectKey::namespaced("default", "web-0"));
        assert_eq!(key.to_string(), "default/web-0");

        let node: ObjectKey = "worker-1".parse().unwrap();
        assert_eq!(node.namespace, None);
        assert!("default/".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn cluster_scoped_kinds() {
        assert!(ResourceKind::Pod.is_namespaced());
        assert!(!ResourceKind::Node.is_namespaced());
        assert!(!ResourceKind::Namespace.is_namespaced());
    }

    #[test]
    fn label_selector_requires_every_pair() {
        let obj = CachedObject::new(
            ResourceKind::Pod,
            ObjectKey::namespaced("default", "web-0"),
            1,
            Value::Null,
        )
        .with_labels([("app", "web"), ("tier", "frontend")]);

        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "web".to_string());
        assert!(obj.matches_labels(&selector));
        selector.insert("tier".to_string(), "backend".to_string());
        assert!(!obj.matches_labels(&selector));
        assert!(obj.matches_labels(&BTreeMap::new()));
    }

    #[test]
    fn watch_event_serializes_type_tag_and_flattened_key() {
        let obj = CachedObject::new(
            ResourceKind::Pod,
            ObjectKey::namespaced("default", "web-0"),
            7,
            json!({"phase": "Running"}),
        );
        let value = serde_json::to_value(WatchEvent::deleted(obj)).unwrap();
        assert_eq!(value["type"], json!("deleted"));
        assert_eq!(value["object"]["namespace"], json!("default"));
        assert_eq!(value["object"]["name"], json!("web-0"));
        assert_eq!(value["object"]["resourceVersion"], json!(7));
    }
}
