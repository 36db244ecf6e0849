//! `clusterlink get` renders cached objects as a table or raw JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Map, Value};
use tabled::{settings::Style, Table, Tabled};

use clusterlink_core::types::{CachedObject, ResourceKind};
use clusterlink_daemon::{request, DaemonError};

use super::home;

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Resource kind (`pods`, `cm`, `deployment`, ...).
    pub kind: ResourceKind,

    /// Object name; omit to list.
    pub name: Option<String>,

    /// Restrict to one namespace.
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Label selector, e.g. `app=web,tier=front`.
    #[arg(short = 'l', long = "selector")]
    pub selector: Option<String>,

    /// Print the raw JSON payload instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ObjectRow {
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Labels")]
    labels: String,
    #[tabled(rename = "Age")]
    age: String,
}

impl GetArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let (action, payload) = self.request_payload();

        let value = match request(&home, self.kind.as_str(), action, payload) {
            Ok(value) => value,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                anyhow::bail!("agent is not running (start it with `clusterlink agent start`)")
            }
            Err(err) => return Err(err).context(format!("failed to {action} {}", self.kind)),
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        let objects: Vec<CachedObject> = match self.name {
            Some(_) => vec![serde_json::from_value(value).context("malformed object in reply")?],
            None => serde_json::from_value(value.get("items").cloned().unwrap_or_default())
                .context("malformed list reply")?,
        };

        if objects.is_empty() {
            println!("{}", format!("No {} found.", self.kind).dimmed());
            return Ok(());
        }

        let now = Utc::now();
        let rows: Vec<ObjectRow> = objects.iter().map(|obj| row(obj, now)).collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
        Ok(())
    }

    fn request_payload(&self) -> (&'static str, Value) {
        let mut payload = Map::new();
        if let Some(namespace) = &self.namespace {
            payload.insert("namespace".into(), json!(namespace));
        }
        match &self.name {
            Some(name) => {
                payload.insert("name".into(), json!(name));
                ("get", Value::Object(payload))
            }
            None => {
                if let Some(selector) = &self.selector {
                    payload.insert("labelSelector".into(), json!(selector));
                }
                ("list", Value::Object(payload))
            }
        }
    }
}

fn row(obj: &CachedObject, now: DateTime<Utc>) -> ObjectRow {
    let labels = obj
        .labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    ObjectRow {
        namespace: obj.namespace().unwrap_or("-").to_string(),
        name: obj.name().to_string(),
        version: obj.resource_version,
        labels: if labels.is_empty() { "-".into() } else { labels },
        age: format_age(now - obj.observed_at),
    }
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(name: Option<&str>) -> GetArgs {
        GetArgs {
            kind: ResourceKind::Pod,
            name: name.map(str::to_string),
            namespace: Some("prod".into()),
            selector: Some("app=web".into()),
            json: false,
        }
    }

    #[test]
    fn list_payload_carries_selector() {
        let (action, payload) = args(None).request_payload();
        assert_eq!(action, "list");
        assert_eq!(payload, json!({ "namespace": "prod", "labelSelector": "app=web" }));
    }

    #[test]
    fn named_lookup_uses_get() {
        let (action, payload) = args(Some("web")).request_payload();
        assert_eq!(action, "get");
        assert_eq!(payload, json!({ "namespace": "prod", "name": "web" }));
    }

    #[test]
    fn ages_use_largest_unit() {
        assert_eq!(format_age(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_age(chrono::Duration::seconds(600)), "10m");
        assert_eq!(format_age(chrono::Duration::hours(5)), "5h");
        assert_eq!(format_age(chrono::Duration::days(3)), "3d");
        assert_eq!(format_age(chrono::Duration::seconds(-5)), "0s");
    }
}
