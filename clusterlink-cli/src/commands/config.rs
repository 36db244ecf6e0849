//! `clusterlink config`: inspect or seed `~/.clusterlink/agent.yaml`.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use clusterlink_core::config::{self, AgentConfig};

use super::home;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration (defaults when no file exists).
    Show,
    /// Write the default configuration file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

pub fn run(command: ConfigCommand) -> Result<()> {
    let home = home()?;
    let path = config::config_path_at(&home);

    match command {
        ConfigCommand::Show => {
            let config = config::load_at(&home)
                .with_context(|| format!("failed to load {}", path.display()))?;
            let source = if path.exists() {
                path.display().to_string()
            } else {
                "built-in defaults".to_string()
            };
            println!("{}", format!("# source: {source}").dimmed());
            println!(
                "{}",
                format!("# manifests: {}", config.manifest_dir_at(&home).display()).dimmed()
            );
            print!("{}", serde_yaml::to_string(&config)?);
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            config::save_at(&home, &AgentConfig::default())
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("{} {}", "wrote".green(), path.display());
        }
    }

    Ok(())
}
