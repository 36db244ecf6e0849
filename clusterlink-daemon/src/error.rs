use std::path::PathBuf;

use thiserror::Error;

use clusterlink_core::{ActionName, ObjectKey, ResourceKind};

/// Error surface for bootstrap, the socket server and the client protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("handler already registered for action '{action}' on resource '{kind}'")]
    DuplicateRegistration {
        kind: ResourceKind,
        action: ActionName,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("cache error: {0}")]
    Cache(#[from] clusterlink_cache::CacheError),

    #[error("config error: {0}")]
    Config(#[from] clusterlink_core::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("agent is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },

    #[error("another agent is already serving {socket}")]
    AgentAlreadyRunning { socket: PathBuf },

    #[error("agent {task} task {reason}")]
    TaskFailed { task: &'static str, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

/// Failure of one request handler. Turned into an error response by the
/// dispatch table; never escapes a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{kind} '{key}' not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Failed(String),
}
