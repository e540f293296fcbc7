//! Message bodies exchanged over the bus.
//!
//! Bodies travel as JSON objects with camelCase keys.

use chaingrid_state::{CapabilitySet, ProcessChain, ProcessChainResults};
use serde::{Deserialize, Serialize};

/// Body of [`LOOKUP_NOW`](crate::addresses::LOOKUP_NOW).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupNow {
    #[serde(default = "default_max_lookups")]
    pub max_lookups: u64,
    #[serde(default)]
    pub update_required_capabilities: bool,
}

fn default_max_lookups() -> u64 {
    u64::MAX
}

/// Body of [`REMOTE_AGENT_MISSING`](crate::addresses::REMOTE_AGENT_MISSING).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMissing {
    /// Number of registered process chains waiting for this capability set.
    pub n: u64,
    pub required_capabilities: CapabilitySet,
}

/// Body of [`CLUSTER_NODE_LEFT`](crate::addresses::CLUSTER_NODE_LEFT).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLeft {
    pub agent_id: String,
}

/// Body of [`CANCEL_PROCESS_CHAIN`](crate::addresses::CANCEL_PROCESS_CHAIN).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelProcessChain {
    pub process_chain_id: String,
}

/// A capability set together with the number of chains that need it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDemand {
    pub capabilities: CapabilitySet,
    pub count: u64,
}

/// Requests understood by an agent at its address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AgentRequest {
    /// Report identity, availability and the chain being executed.
    Info,
    /// Ask whether the agent is free and which of the given capability
    /// sets it would serve.
    Inquire {
        #[serde(rename = "requiredCapabilities")]
        required_capabilities: Vec<CapabilityDemand>,
    },
    Allocate {
        #[serde(rename = "processChainId")]
        process_chain_id: String,
    },
    Deallocate,
    Process {
        #[serde(rename = "processChain")]
        process_chain: ProcessChain,
    },
    Cancel,
    KeepAlive,
}

/// Reply to [`AgentRequest::Info`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub available: bool,
    pub capabilities: CapabilitySet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_chain_id: Option<String>,
}

/// Reply to [`AgentRequest::Inquire`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InquiryReply {
    pub available: bool,
    /// Index into the inquired capability sets the agent would serve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_required_capabilities: Option<usize>,
}

/// Reply to [`AgentRequest::Allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateReply {
    pub accepted: bool,
}

/// Reply to [`AgentRequest::Process`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ProcessReply {
    Success { results: ProcessChainResults },
    Error { message: String },
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_now_wire_format() {
        let body = serde_json::to_value(LookupNow {
            max_lookups: 1,
            update_required_capabilities: false,
        })
        .unwrap();
        assert_eq!(body, json!({"maxLookups": 1, "updateRequiredCapabilities": false}));

        let parsed: LookupNow = serde_json::from_value(json!({})).unwrap();
        assert_eq!(parsed.max_lookups, u64::MAX);
        assert!(!parsed.update_required_capabilities);
    }

    #[test]
    fn agent_requests_are_tagged_by_action() {
        let info = serde_json::to_value(AgentRequest::Info).unwrap();
        assert_eq!(info, json!({"action": "info"}));

        let keep_alive: AgentRequest =
            serde_json::from_value(json!({"action": "keepAlive"})).unwrap();
        assert_eq!(keep_alive, AgentRequest::KeepAlive);

        let allocate: AgentRequest =
            serde_json::from_value(json!({"action": "allocate", "processChainId": "pc-1"}))
                .unwrap();
        assert_eq!(
            allocate,
            AgentRequest::Allocate {
                process_chain_id: "pc-1".into()
            }
        );
    }

    #[test]
    fn agent_missing_wire_format() {
        let body = serde_json::to_value(AgentMissing {
            n: 3,
            required_capabilities: ["gpu"].into_iter().collect(),
        })
        .unwrap();
        assert_eq!(body, json!({"n": 3, "requiredCapabilities": ["gpu"]}));
    }

    #[test]
    fn info_omits_missing_process_chain() {
        let info = AgentInfo {
            id: "a".into(),
            available: true,
            capabilities: CapabilitySet::new(),
            process_chain_id: None,
        };
        let body = serde_json::to_value(&info).unwrap();
        assert!(body.get("processChainId").is_none());
    }
}
