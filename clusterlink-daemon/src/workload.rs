//! Workload operations behind pod actions, and their implementation on the
//! in-process control plane.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::{Stream, StreamExt};

use clusterlink_cache::MemoryControlPlane;
use clusterlink_core::{CachedObject, ObjectKey, ResourceKind};

use crate::error::HandlerError;

/// Lines produced by a running exec or log stream.
pub type OutputStream = Pin<Box<dyn Stream<Item = String> + Send>>;

const EXEC_BUFFER: usize = 64;

/// An attached exec: write to `input`, read from `output`. Dropping `input`
/// ends the process.
pub struct ExecHandle {
    pub input: mpsc::Sender<String>,
    pub output: OutputStream,
}

/// Changes applied by `update`. `body` is a JSON merge patch.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PodUpdate {
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[async_trait]
pub trait WorkloadOps: Send + Sync + 'static {
    async fn delete(&self, key: &ObjectKey) -> Result<Arc<CachedObject>, HandlerError>;

    async fn update(
        &self,
        key: &ObjectKey,
        update: PodUpdate,
    ) -> Result<Arc<CachedObject>, HandlerError>;

    async fn exec(
        &self,
        key: &ObjectKey,
        command: &[String],
        container: Option<&str>,
    ) -> Result<ExecHandle, HandlerError>;

    /// Existing log lines, followed by new ones when `follow` is set.
    async fn logs(
        &self,
        key: &ObjectKey,
        container: Option<&str>,
        follow: bool,
    ) -> Result<OutputStream, HandlerError>;
}

fn not_found(key: &ObjectKey) -> HandlerError {
    HandlerError::NotFound {
        kind: ResourceKind::Pod,
        key: key.clone(),
    }
}

#[async_trait]
impl WorkloadOps for MemoryControlPlane {
    async fn delete(&self, key: &ObjectKey) -> Result<Arc<CachedObject>, HandlerError> {
        MemoryControlPlane::delete(self, ResourceKind::Pod, key).ok_or_else(|| not_found(key))
    }

    async fn update(
        &self,
        key: &ObjectKey,
        update: PodUpdate,
    ) -> Result<Arc<CachedObject>, HandlerError> {
        let existing = self
            .get(ResourceKind::Pod, key)
            .ok_or_else(|| not_found(key))?;
        let mut object = (*existing).clone();
        if let Some(labels) = update.labels {
            object.labels = labels;
        }
        if let Some(patch) = update.body {
            merge_patch(&mut object.body, patch);
        }
        Ok(self.upsert_object(object))
    }

    /// Attached processes echo their input.
    async fn exec(
        &self,
        key: &ObjectKey,
        command: &[String],
        container: Option<&str>,
    ) -> Result<ExecHandle, HandlerError> {
        if self.get(ResourceKind::Pod, key).is_none() {
            return Err(not_found(key));
        }
        if command.is_empty() {
            return Err(HandlerError::InvalidPayload(
                "exec requires a non-empty command".to_string(),
            ));
        }
        tracing::debug!(pod = %key, ?command, container, "exec attached");
        let (input, output) = mpsc::channel(EXEC_BUFFER);
        Ok(ExecHandle {
            input,
            output: Box::pin(ReceiverStream::new(output)),
        })
    }

    async fn logs(
        &self,
        key: &ObjectKey,
        container: Option<&str>,
        follow: bool,
    ) -> Result<OutputStream, HandlerError> {
        if self.get(ResourceKind::Pod, key).is_none() {
            return Err(not_found(key));
        }
        let container = container.map(str::to_owned);
        let (existing, receiver) = self.tail_logs(key);
        let backlog: Vec<String> = existing
            .into_iter()
            .filter(|line| container.is_none() || line.container == container)
            .map(|line| line.line)
            .collect();
        let backlog = tokio_stream::iter(backlog);
        if !follow {
            return Ok(Box::pin(backlog));
        }

        let key = key.clone();
        let live = BroadcastStream::new(receiver).filter_map(move |line| match line {
            Ok(line) if line.key == key && (container.is_none() || line.container == container) => {
                Some(line.line)
            }
            _ => None,
        });
        Ok(Box::pin(backlog.chain(live)))
    }
}

/// Apply a JSON merge patch: objects merge recursively, `null` removes a
/// field, anything else replaces.
pub fn merge_patch(target: &mut Value, patch: Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(fields) = target {
                for (field, value) in entries {
                    if value.is_null() {
                        fields.remove(&field);
                    } else {
                        merge_patch(fields.entry(field).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other,
    }
}
