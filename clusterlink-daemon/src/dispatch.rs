//! Action dispatch table: resource kind -> action -> handler.
//!
//! Built once at bootstrap through [`DispatchTableBuilder`], then frozen behind
//! an `Arc` and read concurrently by every connection without locking.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use clusterlink_core::{ActionName, ResourceKind, Response};

use crate::error::{DaemonError, HandlerError};
use crate::session::Session;

pub type HandlerResult = Result<Value, HandlerError>;

/// Everything a handler sees of one request.
#[derive(Clone)]
pub struct RequestContext {
    pub session: Session,
    pub payload: Value,
}

impl RequestContext {
    pub fn new(session: Session, payload: Value) -> Self {
        Self { session, payload }
    }

    /// Decode the payload; `null` is treated as an empty object.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let payload = match &self.payload {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(payload)
            .map_err(|err| HandlerError::InvalidPayload(err.to_string()))
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: RequestContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: RequestContext) -> HandlerResult {
        self(ctx).await
    }
}

type Routes = BTreeMap<ResourceKind, BTreeMap<ActionName, Arc<dyn Handler>>>;

#[derive(Default)]
pub struct DispatchTableBuilder {
    routes: Routes,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to (`kind`, `action`). A pair can be bound only once;
    /// a second attempt fails and leaves the first binding in place.
    pub fn register<H>(
        &mut self,
        kind: ResourceKind,
        action: ActionName,
        handler: H,
    ) -> Result<&mut Self, DaemonError>
    where
        H: Handler + 'static,
    {
        let actions = self.routes.entry(kind).or_default();
        if actions.contains_key(&action) {
            return Err(DaemonError::DuplicateRegistration { kind, action });
        }
        actions.insert(action, Arc::new(handler));
        tracing::debug!(kind = %kind, action = %action, "registered handler");
        Ok(self)
    }

    pub fn build(self) -> Arc<DispatchTable> {
        let table = DispatchTable {
            routes: self.routes,
        };
        tracing::info!(routes = table.len(), "dispatch table frozen");
        Arc::new(table)
    }
}

pub struct DispatchTable {
    routes: Routes,
}

impl DispatchTable {
    pub fn lookup(&self, kind: ResourceKind, action: ActionName) -> Option<Arc<dyn Handler>> {
        self.routes.get(&kind)?.get(&action).cloned()
    }

    /// Lookup by wire names. Names that do not parse are simply unregistered.
    pub fn lookup_raw(&self, kind: &str, action: &str) -> Option<Arc<dyn Handler>> {
        let kind = kind.parse::<ResourceKind>().ok()?;
        let action = action.parse::<ActionName>().ok()?;
        self.lookup(kind, action)
    }

    /// Route one request and wrap the outcome in a [`Response`]. An unknown
    /// pair produces an "unsupported operation" response and runs nothing.
    pub async fn dispatch(&self, kind: &str, action: &str, ctx: RequestContext) -> Response {
        let session = ctx.session.id();
        let Some(handler) = self.lookup_raw(kind, action) else {
            tracing::debug!(%session, kind, action, "no handler registered");
            return Response::unsupported(kind, action);
        };

        match handler.call(ctx).await {
            Ok(payload) => Response::ok(payload),
            Err(err) => {
                tracing::debug!(%session, kind, action, error = %err, "handler failed");
                Response::error(err.to_string())
            }
        }
    }

    /// Every registered pair, ordered by kind then action.
    pub fn routes(&self) -> Vec<(ResourceKind, ActionName)> {
        self.routes
            .iter()
            .flat_map(|(kind, actions)| actions.keys().map(move |action| (*kind, *action)))
            .collect()
    }

    pub fn actions_for(&self, kind: ResourceKind) -> Vec<ActionName> {
        self.routes
            .get(&kind)
            .map(|actions| actions.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("routes", &self.routes())
            .finish()
    }
}
