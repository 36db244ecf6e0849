//! Long-lived commands: `clusterlink watch` and `clusterlink logs`.
//!
//! Both keep one connection open, check the correlated reply, then print
//! pushed frames until the agent closes the stream or the user hits Ctrl-C.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Map, Value};

use clusterlink_core::types::{CachedObject, EventType, ResourceKind};
use clusterlink_daemon::{stream, DaemonError, RequestFrame};

use super::home;

const REQUEST_ID: u64 = 1;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Resource kind to observe.
    pub kind: ResourceKind,

    /// Print each notification as a JSON line.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Pod name.
    pub name: String,

    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Container within the pod.
    #[arg(short, long)]
    pub container: Option<String>,

    /// Print the existing lines and exit instead of following.
    #[arg(long)]
    pub no_follow: bool,
}

impl WatchArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let frame = RequestFrame::new(self.kind.as_str(), "watch-subscribe", json!({}))
            .with_id(REQUEST_ID);

        let kind = self.kind;
        let json_lines = self.json;
        follow(
            &home,
            &frame,
            |reply| {
                let observers = reply.get("observers").and_then(Value::as_u64).unwrap_or(0);
                eprintln!(
                    "{}",
                    format!("watching {kind} ({observers} observer(s) connected)").dimmed()
                );
            },
            |_, push| {
                if json_lines {
                    println!("{push}");
                } else {
                    print_event(push);
                }
                true
            },
        )
    }
}

impl LogsArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let mut payload = Map::new();
        payload.insert("name".into(), json!(self.name));
        if let Some(namespace) = &self.namespace {
            payload.insert("namespace".into(), json!(namespace));
        }
        if let Some(container) = &self.container {
            payload.insert("container".into(), json!(container));
        }
        payload.insert("follow".into(), json!(!self.no_follow));
        let frame =
            RequestFrame::new(ResourceKind::Pod.as_str(), "open-log", Value::Object(payload))
                .with_id(REQUEST_ID);

        follow(
            &home,
            &frame,
            |_| {},
            |reply, push| {
                if push.get("stream") != reply.get("stream") {
                    return true;
                }
                if push.get("closed").and_then(Value::as_bool).unwrap_or(false) {
                    return false;
                }
                if let Some(line) = push.get("line").and_then(Value::as_str) {
                    println!("{line}");
                }
                true
            },
        )
    }
}

/// Sends `frame`, hands the correlated reply's payload to `on_reply`, then
/// every pushed payload (alongside that reply) to `on_push` until it
/// returns `false`. An error frame, pushed or correlated, ends the stream
/// with its message.
fn follow<R, P>(home: &Path, frame: &RequestFrame, mut on_reply: R, mut on_push: P) -> Result<()>
where
    R: FnMut(&Value),
    P: FnMut(&Value, &Value) -> bool,
{
    let mut failure: Option<String> = None;
    let mut reply: Option<Value> = None;
    // Pushes can overtake the reply on the wire.
    let mut early: Vec<Value> = Vec::new();
    let outcome = stream(home, frame, |incoming| {
        if let Some(message) = &incoming.response.error {
            failure = Some(message.clone());
            return false;
        }
        if incoming.id.is_none() {
            return match &reply {
                Some(reply) => on_push(reply, &incoming.response.payload),
                None => {
                    early.push(incoming.response.payload.clone());
                    true
                }
            };
        }
        let accepted = reply.insert(incoming.response.payload.clone());
        on_reply(accepted);
        early.drain(..).all(|push| on_push(accepted, &push))
    });

    match outcome {
        Ok(()) => {}
        Err(DaemonError::DaemonNotRunning { .. }) => {
            anyhow::bail!("agent is not running (start it with `clusterlink agent start`)")
        }
        Err(err) => {
            return Err(err).context(format!("{} {} stream failed", frame.kind, frame.action))
        }
    }
    match failure {
        Some(message) => anyhow::bail!(message),
        None => Ok(()),
    }
}

fn print_event(push: &Value) {
    let event: Option<EventType> = push
        .get("event")
        .and_then(|e| serde_json::from_value(e.clone()).ok());
    let object: Option<CachedObject> = push
        .get("object")
        .and_then(|o| serde_json::from_value(o.clone()).ok());

    let (Some(event), Some(object)) = (event, object) else {
        println!("{push}");
        return;
    };
    let label = format!("{:<9}", event.to_string().to_uppercase());
    let label = match event {
        EventType::Added => label.green(),
        EventType::Modified => label.yellow(),
        EventType::Deleted => label.red(),
    };
    println!(
        "{label} {} {} {}",
        object.kind,
        object.key,
        format!("rv={}", object.resource_version).dimmed()
    );
}
