//! Uniform response envelope returned by every handler and pushed to observers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::WatchEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// `{status, errorMessage?, payload}`. Wire framing belongs to the transport;
/// this is only the in-memory shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(
        default,
        rename = "errorMessage",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(message.into()),
            payload: Value::Null,
        }
    }

    /// Reply for a (kind, action) pair nobody registered.
    pub fn unsupported(kind: &str, action: &str) -> Self {
        Self::error(format!(
            "unsupported operation: action '{action}' on resource '{kind}'"
        ))
    }

    /// Push notification for one cache mutation.
    pub fn notification(event: &WatchEvent) -> Self {
        match serde_json::to_value(event.object.as_ref()) {
            Ok(object) => Self::ok(json!({
                "event": event.event_type,
                "kind": event.kind(),
                "object": object,
            })),
            Err(err) => Self::error(format!("failed to encode {} event: {err}", event.kind())),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self.status {
            ResponseStatus::Ok => Ok(self.payload),
            ResponseStatus::Error => Err(self
                .error
                .unwrap_or_else(|| "unknown agent error".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CachedObject, ObjectKey, ResourceKind};

    #[test]
    fn error_response_shape() {
        let value = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["errorMessage"], json!("boom"));
        assert_eq!(value["payload"], Value::Null);
    }

    #[test]
    fn ok_response_omits_error_message() {
        let value = serde_json::to_value(Response::ok(json!([1, 2]))).unwrap();
        assert_eq!(value["status"], json!("ok"));
        assert!(value.get("errorMessage").is_none());
    }

    #[test]
    fn unsupported_names_kind_and_action() {
        let response = Response::unsupported("pod", "restart");
        assert!(!response.is_ok());
        let msg = response.into_result().unwrap_err();
        assert!(msg.contains("restart"));
        assert!(msg.contains("pod"));
    }

    #[test]
    fn notification_carries_event_tag_and_object() {
        let obj = CachedObject::new(
            ResourceKind::Namespace,
            ObjectKey::cluster("kube-system"),
            3,
            Value::Null,
        );
        let response = Response::notification(&WatchEvent::added(obj));
        assert!(response.is_ok());
        assert_eq!(response.payload["event"], json!("added"));
        assert_eq!(response.payload["kind"], json!("namespace"));
        assert_eq!(response.payload["object"]["name"], json!("kube-system"));
    }
}
