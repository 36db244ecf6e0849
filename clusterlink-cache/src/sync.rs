//! The one "start + wait for sync + deadline" routine shared by every kind.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use clusterlink_core::ResourceKind;

use crate::error::{CacheError, SourceError};

/// How often the has-synced callback is polled.
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Answer of the has-synced callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPoll {
    Synced,
    Pending,
    /// The initial listing failed; waiting longer is pointless for this call.
    Failed(SourceError),
}

/// Run `start`, then poll `poll` until it reports synced, the `deadline`
/// elapses, or `shutdown` fires. Never blocks longer than `deadline`.
pub async fn wait_for_cache_sync<S, P>(
    kind: ResourceKind,
    deadline: Duration,
    shutdown: &CancellationToken,
    start: S,
    mut poll: P,
) -> Result<(), CacheError>
where
    S: FnOnce(),
    P: FnMut() -> SyncPoll,
{
    start();

    let wait = async {
        let mut ticker = tokio::time::interval(SYNC_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match poll() {
                SyncPoll::Synced => return Ok(()),
                SyncPoll::Pending => {}
                SyncPoll::Failed(err) => {
                    return Err(CacheError::ControlPlaneUnavailable {
                        kind,
                        reason: err.to_string(),
                    })
                }
            }
        }
    };

    tokio::select! {
        _ = shutdown.cancelled() => Err(CacheError::ShuttingDown),
        waited = tokio::time::timeout(deadline, wait) => match waited {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(kind = %kind, timeout = ?deadline, "timed out waiting for cache sync");
                Err(CacheError::SyncTimeout { kind, timeout: deadline })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn returns_once_poll_reports_synced() {
        let started = Cell::new(false);
        let polls = Cell::new(0);
        let shutdown = CancellationToken::new();

        wait_for_cache_sync(
            ResourceKind::Pod,
            Duration::from_secs(30),
            &shutdown,
            || started.set(true),
            || {
                polls.set(polls.get() + 1);
                if polls.get() >= 3 {
                    SyncPoll::Synced
                } else {
                    SyncPoll::Pending
                }
            },
        )
        .await
        .expect("synced");

        assert!(started.get());
        assert_eq!(polls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_closed_with_sync_timeout() {
        let shutdown = CancellationToken::new();
        let err = wait_for_cache_sync(
            ResourceKind::Node,
            Duration::from_secs(2),
            &shutdown,
            || {},
            || SyncPoll::Pending,
        )
        .await
        .unwrap_err();

        match err {
            CacheError::SyncTimeout { kind, timeout } => {
                assert_eq!(kind, ResourceKind::Node);
                assert_eq!(timeout, Duration::from_secs(2));
            }
            other => panic!("expected SyncTimeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn list_failure_is_distinct_from_timeout() {
        let shutdown = CancellationToken::new();
        let err = wait_for_cache_sync(
            ResourceKind::Event,
            Duration::from_secs(30),
            &shutdown,
            || {},
            || SyncPoll::Failed(SourceError::Unavailable("connection refused".into())),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CacheError::ControlPlaneUnavailable { .. }));
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_the_wait() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let err = wait_for_cache_sync(
            ResourceKind::Pod,
            Duration::from_secs(30),
            &shutdown,
            || {},
            || SyncPoll::Pending,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CacheError::ShuttingDown));
    }
}
