//! Resource modules: each binds a kind's cache (and collaborators) to the
//! actions it serves and registers them in the dispatch table.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::StreamExt;

use clusterlink_cache::Informer;
use clusterlink_core::{ActionName, ObjectKey, ResourceKind, Response};

use crate::dispatch::{DispatchTableBuilder, HandlerResult, RequestContext};
use crate::error::{DaemonError, HandlerError};
use crate::hub::NotificationHub;
use crate::session::{stream_closed, Session, StreamTicket};
use crate::workload::{OutputStream, PodUpdate, WorkloadOps};

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    namespace: Option<String>,
    label_selector: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    namespace: Option<String>,
    name: String,
}

impl ObjectRef {
    fn key(&self, kind: ResourceKind) -> Result<ObjectKey, HandlerError> {
        object_key(kind, self.namespace.as_deref(), &self.name)
    }
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    unsubscribe: bool,
}

/// A reply that cannot be encoded is the agent's failure, not the caller's.
fn encoded<T: Serialize + ?Sized>(kind: ResourceKind, value: &T) -> HandlerResult {
    serde_json::to_value(value)
        .map_err(|err| HandlerError::Failed(format!("failed to encode {kind}: {err}")))
}

/// Key of `name` for `kind`; namespaced kinds fall back to `default`.
pub fn object_key(
    kind: ResourceKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<ObjectKey, HandlerError> {
    if name.trim().is_empty() {
        return Err(HandlerError::InvalidPayload("name must not be empty".to_string()));
    }
    Ok(if kind.is_namespaced() {
        ObjectKey::namespaced(namespace.unwrap_or(DEFAULT_NAMESPACE), name)
    } else {
        ObjectKey::cluster(name)
    })
}

/// Parse an equality selector such as `app=web,tier==frontend`.
pub fn parse_label_selector(selector: &str) -> Result<BTreeMap<String, String>, HandlerError> {
    let mut labels = BTreeMap::new();
    for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = term
            .split_once("==")
            .or_else(|| term.split_once('='))
            .ok_or_else(|| {
                HandlerError::InvalidPayload(format!("label selector term '{term}' is not key=value"))
            })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(HandlerError::InvalidPayload(format!(
                "label selector term '{term}' has an empty key"
            )));
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}

/// Generic list / get / watch-subscribe over one kind's cache.
pub struct CacheResource {
    kind: ResourceKind,
    informer: Arc<dyn Informer>,
    hub: Arc<NotificationHub>,
}

impl CacheResource {
    pub fn new(informer: Arc<dyn Informer>, hub: Arc<NotificationHub>) -> Arc<Self> {
        Arc::new(Self {
            kind: informer.kind(),
            informer,
            hub,
        })
    }

    pub fn register(self: &Arc<Self>, builder: &mut DispatchTableBuilder) -> Result<(), DaemonError> {
        let kind = self.kind;
        let this = Arc::clone(self);
        builder.register(kind, ActionName::List, move |ctx: RequestContext| {
            let this = Arc::clone(&this);
            async move { this.list(&ctx) }
        })?;
        let this = Arc::clone(self);
        builder.register(kind, ActionName::Get, move |ctx: RequestContext| {
            let this = Arc::clone(&this);
            async move { this.get(&ctx) }
        })?;
        let this = Arc::clone(self);
        builder.register(kind, ActionName::WatchSubscribe, move |ctx: RequestContext| {
            let this = Arc::clone(&this);
            async move { this.watch_subscribe(&ctx) }
        })?;
        Ok(())
    }

    fn list(&self, ctx: &RequestContext) -> HandlerResult {
        let query: ListQuery = ctx.decode()?;
        let selector = match query.label_selector.as_deref() {
            Some(selector) => parse_label_selector(selector)?,
            None => BTreeMap::new(),
        };
        let items: Vec<Value> = self
            .informer
            .list()
            .into_iter()
            .filter(|object| match &query.namespace {
                Some(namespace) => object.namespace() == Some(namespace.as_str()),
                None => true,
            })
            .filter(|object| object.matches_labels(&selector))
            .map(|object| encoded(self.kind, object.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(json!({
            "kind": self.kind,
            "count": items.len(),
            "items": items,
        }))
    }

    fn get(&self, ctx: &RequestContext) -> HandlerResult {
        let target: ObjectRef = ctx.decode()?;
        let key = target.key(self.kind)?;
        let object = self
            .informer
            .get_by_key(&key)
            .ok_or(HandlerError::NotFound {
                kind: self.kind,
                key,
            })?;
        encoded(self.kind, object.as_ref())
    }

    fn watch_subscribe(&self, ctx: &RequestContext) -> HandlerResult {
        let request: SubscribeRequest = ctx.decode()?;
        let session = ctx.session.id();
        let subscribed = if request.unsubscribe {
            self.hub.unsubscribe(session, self.kind);
            false
        } else {
            self.hub
                .subscribe(session, self.kind, ctx.session.push_sender());
            true
        };
        Ok(json!({
            "kind": self.kind,
            "subscribed": subscribed,
            "observers": self.hub.subscriber_count(self.kind),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    namespace: Option<String>,
    name: String,
    #[serde(flatten)]
    update: PodUpdate,
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    namespace: Option<String>,
    name: String,
    command: Vec<String>,
    container: Option<String>,
    stream: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StdinRequest {
    stream: String,
    data: String,
}

fn default_follow() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct LogRequest {
    namespace: Option<String>,
    name: String,
    container: Option<String>,
    #[serde(default = "default_follow")]
    follow: bool,
    stream: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloseRequest {
    stream: String,
}

/// Pod-only actions delegated to the workload collaborator. Streaming
/// actions spawn a task tied to the session and return at once.
pub struct PodResource {
    informer: Arc<dyn Informer>,
    ops: Arc<dyn WorkloadOps>,
}

impl PodResource {
    pub fn new(informer: Arc<dyn Informer>, ops: Arc<dyn WorkloadOps>) -> Arc<Self> {
        Arc::new(Self { informer, ops })
    }

    pub fn register(self: &Arc<Self>, builder: &mut DispatchTableBuilder) -> Result<(), DaemonError> {
        let this = Arc::clone(self);
        builder.register(ResourceKind::Pod, ActionName::Delete, move |ctx: RequestContext| {
            let this = Arc::clone(&this);
            async move { this.delete(ctx).await }
        })?;
        let this = Arc::clone(self);
        builder.register(ResourceKind::Pod, ActionName::Update, move |ctx: RequestContext| {
            let this = Arc::clone(&this);
            async move { this.update(ctx).await }
        })?;
        let this = Arc::clone(self);
        builder.register(ResourceKind::Pod, ActionName::Exec, move |ctx: RequestContext| {
            let this = Arc::clone(&this);
            async move { this.exec(ctx).await }
        })?;
        builder.register(ResourceKind::Pod, ActionName::Stdin, |ctx: RequestContext| async move {
            stdin(ctx).await
        })?;
        let this = Arc::clone(self);
        builder.register(ResourceKind::Pod, ActionName::OpenLog, move |ctx: RequestContext| {
            let this = Arc::clone(&this);
            async move { this.open_log(ctx).await }
        })?;
        builder.register(ResourceKind::Pod, ActionName::CloseLog, |ctx: RequestContext| async move {
            close_log(&ctx)
        })?;
        Ok(())
    }

    fn cached_pod(&self, key: &ObjectKey) -> Result<(), HandlerError> {
        match self.informer.get_by_key(key) {
            Some(_) => Ok(()),
            None => Err(HandlerError::NotFound {
                kind: ResourceKind::Pod,
                key: key.clone(),
            }),
        }
    }

    async fn delete(&self, ctx: RequestContext) -> HandlerResult {
        let target: ObjectRef = ctx.decode()?;
        let key = target.key(ResourceKind::Pod)?;
        let deleted = self.ops.delete(&key).await?;
        tracing::info!(session = %ctx.session.id(), pod = %key, "pod deleted");
        Ok(json!({
            "deleted": key.to_string(),
            "resourceVersion": deleted.resource_version,
        }))
    }

    async fn update(&self, ctx: RequestContext) -> HandlerResult {
        let request: UpdateRequest = ctx.decode()?;
        let key = object_key(ResourceKind::Pod, request.namespace.as_deref(), &request.name)?;
        let updated = self.ops.update(&key, request.update).await?;
        encoded(ResourceKind::Pod, updated.as_ref())
    }

    async fn exec(&self, ctx: RequestContext) -> HandlerResult {
        let request: ExecRequest = ctx.decode()?;
        let key = object_key(ResourceKind::Pod, request.namespace.as_deref(), &request.name)?;
        self.cached_pod(&key)?;
        let exec = self
            .ops
            .exec(&key, &request.command, request.container.as_deref())
            .await?;

        let name = request.stream.unwrap_or_else(|| format!("exec:{key}"));
        let ticket = ctx.session.open_stream(&name, Some(exec.input));
        spawn_stream(ctx.session.clone(), ticket, key.clone(), exec.output, "output");
        Ok(json!({ "stream": name, "pod": key.to_string() }))
    }

    async fn open_log(&self, ctx: RequestContext) -> HandlerResult {
        let request: LogRequest = ctx.decode()?;
        let key = object_key(ResourceKind::Pod, request.namespace.as_deref(), &request.name)?;
        self.cached_pod(&key)?;
        let lines = self
            .ops
            .logs(&key, request.container.as_deref(), request.follow)
            .await?;

        let name = request.stream.unwrap_or_else(|| format!("log:{key}"));
        let ticket = ctx.session.open_stream(&name, None);
        spawn_stream(ctx.session.clone(), ticket, key.clone(), lines, "line");
        Ok(json!({ "stream": name, "pod": key.to_string(), "follow": request.follow }))
    }
}

async fn stdin(ctx: RequestContext) -> HandlerResult {
    let request: StdinRequest = ctx.decode()?;
    let input = ctx.session.stream_input(&request.stream).ok_or_else(|| {
        HandlerError::InvalidPayload(format!("no exec stream '{}' is open", request.stream))
    })?;
    let bytes = request.data.len();
    input
        .send(request.data)
        .await
        .map_err(|_| HandlerError::Failed(format!("exec stream '{}' has ended", request.stream)))?;
    Ok(json!({ "stream": request.stream, "bytes": bytes }))
}

fn close_log(ctx: &RequestContext) -> HandlerResult {
    let request: CloseRequest = ctx.decode()?;
    if !ctx.session.close_stream(&request.stream) {
        return Err(HandlerError::InvalidPayload(format!(
            "no stream '{}' is open",
            request.stream
        )));
    }
    Ok(json!({ "stream": request.stream, "closed": true }))
}

/// Forward `output` to the session as pushed frames until it ends, the
/// stream is closed, or the session goes away.
fn spawn_stream(
    session: Session,
    ticket: StreamTicket,
    pod: ObjectKey,
    mut output: OutputStream,
    field: &'static str,
) {
    let push = session.push_sender();
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                _ = ticket.cancel_token().cancelled() => break "closed",
                next = output.next() => match next {
                    Some(line) => {
                        let mut payload = json!({ "stream": ticket.name, "pod": pod.to_string() });
                        payload[field] = Value::String(line);
                        if push.send(Response::ok(payload)).await.is_err() {
                            break "disconnected";
                        }
                    }
                    None => break "ended",
                }
            }
        };
        session.finish_stream(&ticket);
        if reason != "disconnected" {
            let _ = push.try_send(stream_closed(&ticket.name, reason));
        }
        tracing::debug!(session = %session.id(), stream = %ticket.name, reason, "stream finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("app=web", &[("app", "web")])]
    #[case("app==web, tier=frontend", &[("app", "web"), ("tier", "frontend")])]
    #[case("", &[])]
    fn label_selectors_parse(#[case] selector: &str, #[case] expected: &[(&str, &str)]) {
        let parsed = parse_label_selector(selector).unwrap();
        let expected: BTreeMap<String, String> = expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(parsed, expected);
    }

    #[rstest]
    #[case("app")]
    #[case("=web")]
    fn malformed_selectors_are_rejected(#[case] selector: &str) {
        assert!(matches!(
            parse_label_selector(selector),
            Err(HandlerError::InvalidPayload(_))
        ));
    }

    #[test]
    fn unencodable_reply_is_an_agent_failure() {
        let tuple_keys = BTreeMap::from([((1u8, 2u8), "x")]);
        assert!(matches!(
            encoded(ResourceKind::Pod, &tuple_keys),
            Err(HandlerError::Failed(message)) if message.starts_with("failed to encode pod")
        ));
    }

    #[test]
    fn namespaced_kinds_default_their_namespace() {
        assert_eq!(
            object_key(ResourceKind::Pod, None, "web").unwrap(),
            ObjectKey::namespaced("default", "web")
        );
        assert_eq!(
            object_key(ResourceKind::Node, Some("ignored"), "n1").unwrap(),
            ObjectKey::cluster("n1")
        );
        assert!(object_key(ResourceKind::Pod, None, " ").is_err());
    }
}
