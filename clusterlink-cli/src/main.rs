//! clusterlink: cluster agent control CLI.
//!
//! # Usage
//!
//! ```text
//! clusterlink agent start [--log-json] | stop | status
//! clusterlink get <kind> [name] [-n <namespace>] [-l <selector>] [--json]
//! clusterlink watch <kind>
//! clusterlink logs <pod> [-n <namespace>] [-c <container>] [--no-follow]
//! clusterlink delete <pod> [-n <namespace>]
//! clusterlink call <kind> <action> [payload-json]
//! clusterlink config show | init
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    agent::AgentCommand, call::CallArgs, call::DeleteArgs, config::ConfigCommand, get::GetArgs,
    stream::LogsArgs, stream::WatchArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "clusterlink",
    version,
    about = "Query and drive the clusterlink agent",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run, stop or inspect the background agent.
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },

    /// List objects of a kind, or show one object.
    Get(GetArgs),

    /// Stream change notifications for a kind.
    Watch(WatchArgs),

    /// Stream a pod's log lines.
    Logs(LogsArgs),

    /// Delete a pod.
    Delete(DeleteArgs),

    /// Send a raw (kind, action, payload) request.
    Call(CallArgs),

    /// Show or initialize `~/.clusterlink/agent.yaml`.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent { command } => commands::agent::run(command),
        Commands::Get(args) => args.run(),
        Commands::Watch(args) => args.run(),
        Commands::Logs(args) => args.run(),
        Commands::Delete(args) => args.run(),
        Commands::Call(args) => args.run(),
        Commands::Config { command } => commands::config::run(command),
    }
}
