//! `clusterlink agent`: background agent lifecycle.

use anyhow::{Context, Result};
use clap::Subcommand;

use clusterlink_daemon::paths::socket_path;
use clusterlink_daemon::{request_status, request_stop, start_blocking, DaemonError, LogFormat};

use super::home;

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Run the agent in the foreground (cache sync + socket server).
    Start {
        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Request graceful agent shutdown over the Unix socket.
    Stop,
    /// Query agent runtime status over the Unix socket.
    Status,
}

pub fn run(command: AgentCommand) -> Result<()> {
    let home = home()?;

    match command {
        AgentCommand::Start { log_json } => {
            let format = if log_json {
                LogFormat::Json
            } else {
                LogFormat::Text
            };
            start_blocking(&home, format).context("agent exited with error")?;
        }
        AgentCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("agent stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("agent is not running"),
            Err(err) => return Err(err).context("failed to stop agent"),
        },
        AgentCommand::Status => {
            let status = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query agent status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render agent status JSON")?
            );
        }
    }

    Ok(())
}
