use std::path::{Path, PathBuf};
use std::time::Duration;

pub use clusterlink_core::config::agent_root;

pub const AGENT_SOCKET: &str = "agent.sock";

/// Quiet period before a changed manifest is applied.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

pub fn socket_path(home: &Path) -> PathBuf {
    agent_root(home).join(AGENT_SOCKET)
}
