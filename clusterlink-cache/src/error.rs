//! Error types for clusterlink-cache.

use std::time::Duration;

use clusterlink_core::ResourceKind;
use thiserror::Error;

/// Failures reported by a [`ListWatch`](crate::ListWatch) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The control plane could not be reached or refused the request.
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    /// The requested resource version is no longer retained; relist.
    #[error("resource version {0} is too old")]
    Expired(u64),
}

/// All errors that can arise from cache synchronization.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache never reached "synced" within the deadline. The watcher keeps
    /// running and a later `start` may still succeed.
    #[error("timed out after {timeout:?} waiting for {kind} cache to sync")]
    SyncTimeout { kind: ResourceKind, timeout: Duration },

    /// The initial listing failed. Recoverable: the caller decides whether to
    /// retry or abort.
    #[error("control plane unavailable while listing {kind}: {reason}")]
    ControlPlaneUnavailable { kind: ResourceKind, reason: String },

    /// The shared shutdown signal fired while waiting.
    #[error("shutdown requested while waiting for cache sync")]
    ShuttingDown,
}

impl CacheError {
    /// Whether retrying `start` later can succeed without operator action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::ControlPlaneUnavailable { .. } | CacheError::SyncTimeout { .. }
        )
    }
}
