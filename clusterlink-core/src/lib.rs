//! clusterlink core library: resource vocabulary, response envelope, agent
//! configuration.
//!
//! - [`types`]: resource kinds, actions, cached object snapshots, watch events
//! - [`response`]: the uniform [`Response`] envelope
//! - [`config`]: `~/.clusterlink/agent.yaml` load / save
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod response;
pub mod types;

pub use config::AgentConfig;
pub use error::ConfigError;
pub use response::{Response, ResponseStatus};
pub use types::{
    ActionName, CachedObject, EventType, ObjectKey, ParseNameError, ResourceKind, SessionId,
    WatchEvent,
};
