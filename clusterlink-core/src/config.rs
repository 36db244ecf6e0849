//! Agent configuration at `~/.clusterlink/agent.yaml`.
//!
//! # API pattern
//!
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! A missing file is not an error: every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::types::ResourceKind;

pub const CONFIG_FILE: &str = "agent.yaml";
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_OBSERVER_QUEUE: usize = 256;

/// Tunables for cache synchronization and observer delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Deadline for one kind to reach "synced" during bootstrap.
    pub sync_timeout_secs: u64,
    /// Synchronize all kinds concurrently instead of one after the other.
    pub parallel_sync: bool,
    /// Outbound queue length per connected observer.
    pub observer_queue: usize,
    /// Kinds mirrored by the agent.
    pub kinds: Vec<ResourceKind>,
    /// Directory of YAML manifests feeding the local control plane.
    /// Relative paths are resolved against `~/.clusterlink/`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sync_timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
            parallel_sync: true,
            observer_queue: DEFAULT_OBSERVER_QUEUE,
            kinds: ResourceKind::ALL.to_vec(),
            manifest_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Effective manifest directory for a given home.
    pub fn manifest_dir_at(&self, home: &Path) -> PathBuf {
        match &self.manifest_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => agent_root(home).join(dir),
            None => agent_root(home).join("manifests"),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sync_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.observer_queue == 0 {
            return Err(ConfigError::Invalid {
                field: "observer_queue",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.kinds.is_empty() {
            return Err(ConfigError::Invalid {
                field: "kinds",
                reason: "at least one resource kind must be mirrored".to_string(),
            });
        }
        Ok(())
    }
}

/// `<home>/.clusterlink/`
pub fn agent_root(home: &Path) -> PathBuf {
    home.join(".clusterlink")
}

/// `<home>/.clusterlink/agent.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    agent_root(home).join(CONFIG_FILE)
}

/// Load and validate the config. Returns defaults when the file is absent.
pub fn load_at(home: &Path) -> Result<AgentConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(AgentConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let config: AgentConfig = if contents.trim().is_empty() {
        AgentConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?
    };
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<AgentConfig, ConfigError> {
    load_at(&home()?)
}

/// Atomically save the config.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &AgentConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let root = agent_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        set_permissions(&root, 0o700)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_permissions(&tmp_path, 0o600)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &AgentConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), ConfigError> {
    Ok(())
}
