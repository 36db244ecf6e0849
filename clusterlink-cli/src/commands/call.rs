//! One-shot requests: `clusterlink call` and `clusterlink delete`.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};

use clusterlink_core::types::ResourceKind;
use clusterlink_daemon::{request, DaemonError};

use super::home;

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Wire name of the resource kind, or `agent`.
    pub kind: String,

    /// Wire name of the action (`list`, `open-log`, ...).
    pub action: String,

    /// JSON payload; defaults to `{}`.
    pub payload: Option<String>,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Pod name.
    pub name: String,

    #[arg(short, long)]
    pub namespace: Option<String>,
}

impl CallArgs {
    pub fn run(self) -> Result<()> {
        let payload = parse_payload(self.payload.as_deref())?;
        let value = send(&self.kind, &self.action, payload)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    }
}

impl DeleteArgs {
    pub fn run(self) -> Result<()> {
        let mut payload = json!({ "name": self.name });
        if let Some(namespace) = &self.namespace {
            payload["namespace"] = json!(namespace);
        }
        let value = send(ResourceKind::Pod.as_str(), "delete", payload)?;
        let deleted = value
            .get("deleted")
            .and_then(Value::as_str)
            .unwrap_or(self.name.as_str());
        println!("{} pod {}", "deleted".red(), deleted);
        Ok(())
    }
}

fn parse_payload(raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(json!({})),
        Some(text) => serde_json::from_str(text).context("payload is not valid JSON"),
    }
}

fn send(kind: &str, action: &str, payload: Value) -> Result<Value> {
    let home = home()?;
    match request(&home, kind, action, payload) {
        Ok(value) => Ok(value),
        Err(DaemonError::DaemonNotRunning { .. }) => {
            anyhow::bail!("agent is not running (start it with `clusterlink agent start`)")
        }
        Err(DaemonError::Protocol(message)) => anyhow::bail!(message),
        Err(err) => Err(err).context(format!("{kind} {action} request failed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_payload_is_an_empty_object() {
        assert_eq!(parse_payload(None).unwrap(), json!({}));
    }

    #[test]
    fn payload_must_be_json() {
        assert_eq!(
            parse_payload(Some(r#"{"name":"web"}"#)).unwrap(),
            json!({ "name": "web" })
        );
        assert!(parse_payload(Some("name=web")).is_err());
    }
}
