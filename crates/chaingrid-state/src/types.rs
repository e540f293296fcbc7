//! Domain types for the ChainGrid registries.
//!
//! Submissions own process chains; VMs reference the setup they were
//! created from. All types are serializable to/from JSON for storage in
//! redb tables and for transport over the event bus.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a submission.
pub type SubmissionId = String;

/// Unique identifier for a process chain.
pub type ProcessChainId = String;

/// Unique identifier for a VM.
pub type VmId = String;

/// Output variable name to collected values.
pub type ProcessChainResults = HashMap<String, Vec<Value>>;

// ── Capabilities ───────────────────────────────────────────────────

/// A normalized, order-independent set of capability tags.
///
/// Two sets built from the same tags in a different order (or with
/// duplicates) compare equal and hash identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.0.contains(capability)
    }

    /// True if every tag in `other` is also in `self`.
    pub fn is_superset_of(&self, other: &CapabilitySet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn is_subset_of(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, cap) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{cap}")?;
        }
        write!(f, "]")
    }
}

// ── Submissions ────────────────────────────────────────────────────

/// Lifecycle state of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Accepted,
    Running,
    Success,
    Error,
    Cancelled,
    PartialSuccess,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Accepted | Self::Running)
    }
}

/// A user-submitted workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub id: SubmissionId,
    /// Workflow definition; opaque to the scheduler.
    pub workflow: Value,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Option<ProcessChainResults>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Planner state kept for resuming a submission after a restart.
    #[serde(default)]
    pub execution_state: Option<Value>,
}

impl Submission {
    /// A freshly accepted submission with no timestamps or results.
    pub fn new(id: impl Into<String>, workflow: Value) -> Self {
        Self {
            id: id.into(),
            workflow,
            status: SubmissionStatus::Accepted,
            start_time: None,
            end_time: None,
            results: None,
            error_message: None,
            execution_state: None,
        }
    }
}

// ── Process chains ─────────────────────────────────────────────────

/// Lifecycle state of a process chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessChainStatus {
    Registered,
    Running,
    Success,
    Error,
    Cancelled,
}

impl ProcessChainStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for ProcessChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "REGISTERED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A single step of a process chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Executable {
    pub id: String,
    /// Program to run.
    pub path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// An ordered sequence of executables with declared capability needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessChain {
    pub id: ProcessChainId,
    pub executables: Vec<Executable>,
    #[serde(default)]
    pub required_capabilities: CapabilitySet,
}

impl ProcessChain {
    pub fn new(id: impl Into<String>, required_capabilities: CapabilitySet) -> Self {
        Self {
            id: id.into(),
            executables: Vec::new(),
            required_capabilities,
        }
    }
}

// ── Setups and VMs ─────────────────────────────────────────────────

/// Template describing how to provision a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Setup {
    pub id: String,
    pub flavor: String,
    pub image_name: String,
    pub availability_zone: String,
    pub block_device_size_gb: u32,
    #[serde(default)]
    pub block_device_volume_type: Option<String>,
    #[serde(default)]
    pub min_vms: u32,
    pub max_vms: u32,
    /// Upper bound on VMs of this setup being created at once.
    /// Defaults to `max_vms`.
    #[serde(default)]
    pub max_create_concurrent: Option<u32>,
    #[serde(default)]
    pub provisioning_scripts: Vec<String>,
    #[serde(default)]
    pub provided_capabilities: CapabilitySet,
    /// Overrides the global SSH username.
    #[serde(default)]
    pub ssh_username: Option<String>,
}

impl Setup {
    pub fn max_create_concurrent(&self) -> u32 {
        self.max_create_concurrent.unwrap_or(self.max_vms)
    }
}

/// Policy bounding the number of remote agents serving a capability set,
/// across all setups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolAgentParams {
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub min: u32,
    /// Unbounded when absent.
    #[serde(default)]
    pub max: Option<u32>,
}

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmStatus {
    Creating,
    Provisioning,
    Running,
    Destroyed,
    Error,
}

impl VmStatus {
    /// VMs that no longer occupy capacity.
    pub fn is_terminated(self) -> bool {
        matches!(self, Self::Destroyed | Self::Error)
    }

    /// VMs that are being created or provisioned.
    pub fn is_starting(self) -> bool {
        matches!(self, Self::Creating | Self::Provisioning)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Provisioning => "PROVISIONING",
            Self::Running => "RUNNING",
            Self::Destroyed => "DESTROYED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A VM created from a setup, owned by the cloud manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vm {
    pub id: VmId,
    pub setup: Setup,
    pub status: VmStatus,
    /// Provider-assigned id, known once the VM has been created.
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub destruction_time: Option<DateTime<Utc>>,
    /// Why the VM is in its current state (e.g. the provisioning error).
    #[serde(default)]
    pub reason: Option<String>,
}

impl Vm {
    pub fn new(id: impl Into<String>, setup: Setup) -> Self {
        Self {
            id: id.into(),
            setup,
            status: VmStatus::Creating,
            external_id: None,
            ip_address: None,
            agent_id: None,
            creation_time: None,
            destruction_time: None,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_sets_ignore_order_and_duplicates() {
        let a: CapabilitySet = ["gpu", "docker"].into_iter().collect();
        let b: CapabilitySet = ["docker", "gpu", "docker"].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.to_string(), "[docker, gpu]");
    }

    #[test]
    fn capability_superset() {
        let agent: CapabilitySet = ["gpu", "docker"].into_iter().collect();
        let chain: CapabilitySet = ["gpu"].into_iter().collect();
        assert!(agent.is_superset_of(&chain));
        assert!(!chain.is_superset_of(&agent));
        assert!(agent.is_superset_of(&CapabilitySet::new()));
    }

    #[test]
    fn capability_set_serializes_as_array() {
        let caps: CapabilitySet = ["b", "a"].into_iter().collect();
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(json, serde_json::json!(["a", "b"]));
    }

    #[test]
    fn setup_max_create_concurrent_defaults_to_max_vms() {
        let toml_like = serde_json::json!({
            "id": "s1",
            "flavor": "m1.small",
            "image_name": "ubuntu",
            "availability_zone": "az1",
            "block_device_size_gb": 20,
            "max_vms": 4,
        });
        let setup: Setup = serde_json::from_value(toml_like).unwrap();
        assert_eq!(setup.max_create_concurrent(), 4);
        assert_eq!(setup.min_vms, 0);
        assert!(setup.provided_capabilities.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ProcessChainStatus::Cancelled.is_terminal());
        assert!(!ProcessChainStatus::Running.is_terminal());
        assert!(SubmissionStatus::PartialSuccess.is_terminal());
        assert!(VmStatus::Error.is_terminated());
        assert!(VmStatus::Provisioning.is_starting());
        assert!(!VmStatus::Running.is_starting());
    }

    #[test]
    fn status_wire_format() {
        let json = serde_json::to_string(&ProcessChainStatus::Registered).unwrap();
        assert_eq!(json, "\"REGISTERED\"");
        let status: SubmissionStatus = serde_json::from_str("\"PARTIAL_SUCCESS\"").unwrap();
        assert_eq!(status, SubmissionStatus::PartialSuccess);
    }
}
