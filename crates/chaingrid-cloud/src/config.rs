//! Cloud manager configuration and setups file loading.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chaingrid_state::{PoolAgentParams, Setup};
use serde::{Deserialize, Serialize};

use crate::error::{CloudError, CloudResult};

/// The `[cloud]` section of the node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Tag attached to every VM and block device this system creates.
    /// Provider resources without it are never touched.
    pub created_by_tag: String,
    pub setups_file: Option<PathBuf>,
    pub sync_interval_secs: u64,
    pub keep_alive_interval_secs: u64,
    /// Destroy all VMs created by this node when it shuts down.
    pub destroy_on_shutdown: bool,
    pub ssh: SshConfig,
    pub agent_pool: Vec<PoolAgentParams>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            created_by_tag: "chaingrid".to_string(),
            setups_file: None,
            sync_interval_secs: 120,
            keep_alive_interval_secs: 30,
            destroy_on_shutdown: true,
            ssh: SshConfig::default(),
            agent_pool: Vec::new(),
        }
    }
}

impl CloudConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    /// Username for SSH connections to VMs of `setup`.
    pub fn ssh_username<'a>(&'a self, setup: &'a Setup) -> Option<&'a str> {
        setup
            .ssh_username
            .as_deref()
            .or(self.ssh.username.as_deref())
    }
}

/// The `[cloud.ssh]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Global username; setups may override it.
    pub username: Option<String>,
    pub private_key_location: Option<PathBuf>,
    pub connect_attempts: u32,
    pub connect_backoff_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: None,
            private_key_location: None,
            connect_attempts: 30,
            connect_backoff_secs: 2,
        }
    }
}

impl SshConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_secs)
    }
}

#[derive(Debug, Deserialize)]
struct SetupsFile {
    #[serde(default)]
    setups: Vec<Setup>,
}

/// Parse a setups file: a TOML document with a `[[setups]]` array.
pub fn parse_setups(content: &str) -> CloudResult<Vec<Setup>> {
    let file: SetupsFile =
        toml::from_str(content).map_err(|e| CloudError::Config(format!("invalid setups: {e}")))?;
    Ok(file.setups)
}

/// Read and parse the setups file at `path`.
pub fn load_setups(path: &Path) -> CloudResult<Vec<Setup>> {
    let content = std::fs::read_to_string(path)?;
    parse_setups(&content)
}

/// Check setups against each other and the configuration. Any error here
/// must abort startup.
pub fn validate_setups(setups: &[Setup], config: &CloudConfig) -> CloudResult<()> {
    let mut ids = HashSet::new();
    for setup in setups {
        if !ids.insert(setup.id.as_str()) {
            return Err(CloudError::Config(format!(
                "duplicate setup id `{}`",
                setup.id
            )));
        }
        if setup.min_vms > setup.max_vms {
            return Err(CloudError::Config(format!(
                "setup `{}` has min_vms {} above max_vms {}",
                setup.id, setup.min_vms, setup.max_vms
            )));
        }
        if config.ssh_username(setup).is_none() {
            return Err(CloudError::Config(format!(
                "setup `{}` has no ssh username and no global one is configured",
                setup.id
            )));
        }
    }
    Ok(())
}
