//! Node configuration file.

use std::path::Path;
use std::time::Duration;

use chaingrid_cloud::CloudConfig;
use chaingrid_scheduler::SchedulerConfig;
use chaingrid_state::CapabilitySet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub agent: AgentSection,
    pub scheduler: SchedulerSection,
    pub cloud: CloudConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Identity of this node. Local agents derive their ids from it.
    pub id: Option<String>,
    pub capabilities: CapabilitySet,
    /// Number of local agents to start.
    pub instances: usize,
    pub busy_timeout_secs: u64,
    pub output_lines_to_collect: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            capabilities: CapabilitySet::new(),
            instances: 1,
            busy_timeout_secs: 60,
            output_lines_to_collect: 100,
        }
    }
}

impl AgentSection {
    /// Ids of the local agents: the node id for the first, suffixed with
    /// the instance number for the rest.
    pub fn agent_ids(&self) -> Vec<String> {
        let Some(id) = self.id.as_deref() else {
            return Vec::new();
        };
        (0..self.instances)
            .map(|i| if i == 0 { id.to_string() } else { format!("{id}-{i}") })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enabled: bool,
    pub lookup_interval_ms: u64,
    pub lookup_orphans_interval_ms: u64,
    pub lookup_orphans_initial_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            lookup_interval_ms: 20_000,
            lookup_orphans_interval_ms: 300_000,
            lookup_orphans_initial_delay_ms: 0,
            request_timeout_ms: 10_000,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler.request_timeout_ms)
    }

    /// Scheduler settings. The id is empty when `[agent] id` is missing,
    /// which the scheduler rejects.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig::new(self.agent.id.clone().unwrap_or_default())
            .with_lookup_interval(Duration::from_millis(s.lookup_interval_ms))
            .with_lookup_orphans_interval(Duration::from_millis(s.lookup_orphans_interval_ms))
            .with_lookup_orphans_initial_delay(Duration::from_millis(
                s.lookup_orphans_initial_delay_ms,
            ))
            .with_request_timeout(self.request_timeout())
    }
}
