use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use clusterlink_cache::MemoryControlPlane;
use clusterlink_core::{config, SessionId};

use crate::agent::Agent;
use crate::error::{io_err, DaemonError};
use crate::manifest::ManifestFeed;
use crate::paths::{agent_root, socket_path};
use crate::session::serve_connection;

/// How the daemon writes its logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Start the agent and block the current thread until it exits.
pub fn start_blocking(home: &Path, format: LogFormat) -> Result<(), DaemonError> {
    init_tracing(format);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the agent: load manifests, sync every configured kind, then serve the
/// socket until ctrl-c or a `stop` request.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let root = agent_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    let config = config::load_at(&home)?;
    let socket = socket_path(&home);
    // Refuse early when another agent owns the socket.
    claim_socket(&socket)?;

    let shutdown = CancellationToken::new();
    let signal_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { signal_task(shutdown).await })
    };

    let plane = Arc::new(MemoryControlPlane::new());
    let mut feed = ManifestFeed::new(&config.manifest_dir_at(&home), plane.clone())?;
    feed.load_all()?;

    let agent = match Agent::bootstrap(plane.clone(), plane, &config, shutdown.clone()).await {
        Ok(agent) => Arc::new(agent),
        Err(err) => {
            shutdown.cancel();
            let _ = signal_handle.await;
            return Err(err);
        }
    };

    let feed_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = feed.run(shutdown.clone()).await;
            shutdown.cancel();
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown.clone();
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            let result = socket_server_task(socket, agent, shutdown.clone()).await;
            shutdown.cancel();
            result
        })
    };

    let (feed_result, socket_result, signal_result) =
        tokio::join!(feed_handle, socket_handle, signal_handle);

    for outcome in [
        task_outcome("manifest feed", feed_result),
        task_outcome("socket server", socket_result),
        task_outcome("signal handler", signal_result),
    ] {
        outcome?;
    }
    tracing::info!("agent stopped");
    Ok(())
}

async fn signal_task(shutdown: CancellationToken) -> Result<(), DaemonError> {
    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("received ctrl-c, shutting down agent");
                shutdown.cancel();
                Ok(())
            }
            Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
        }
    }
}

async fn socket_server_task(
    socket: PathBuf,
    agent: Arc<Agent>,
    shutdown: CancellationToken,
) -> Result<(), DaemonError> {
    let listener = bind_agent_socket(&socket)?;
    tracing::info!(socket = %socket.display(), "agent socket listening");

    let next_session = AtomicU64::new(1);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let id = SessionId(next_session.fetch_add(1, Ordering::Relaxed));
                let agent = Arc::clone(&agent);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, id, agent, shutdown).await {
                        tracing::error!(session = %id, error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

/// Make `socket` bindable. A socket file that still accepts connections
/// belongs to a live agent; one that refuses them was left by an agent that
/// died without cleaning up and is removed.
fn claim_socket(socket: &Path) -> Result<(), DaemonError> {
    let refusal = match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::AgentAlreadyRunning {
                socket: socket.to_path_buf(),
            })
        }
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => err,
    };
    tracing::warn!(
        socket = %socket.display(),
        error = %refusal,
        "reclaiming socket left by a previous agent",
    );
    match fs::remove_file(socket) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(io_err(socket, err)),
        _ => Ok(()),
    }
}

/// Bind the agent socket, readable and writable by its owner only.
fn bind_agent_socket(socket: &Path) -> Result<UnixListener, DaemonError> {
    use std::os::unix::fs::PermissionsExt;

    claim_socket(socket)?;
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    fs::set_permissions(socket, fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(socket, e))?;
    Ok(listener)
}

/// Fold one joined agent task into the run result, logging which task ended
/// the agent.
fn task_outcome(
    task: &'static str,
    joined: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    let reason = match joined {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => {
            tracing::error!(task, error = %err, "agent task failed");
            return Err(err);
        }
        Err(err) if err.is_panic() => "panicked",
        Err(_) => "was cancelled",
    };
    tracing::error!(task, reason, "agent task aborted");
    Err(DaemonError::TaskFailed {
        task,
        reason: reason.to_string(),
    })
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
