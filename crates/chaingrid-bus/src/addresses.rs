//! Well-known event bus addresses.

/// Ask the local scheduler to look for work. Body: [`LookupNow`](crate::LookupNow).
pub const LOOKUP_NOW: &str = "chaingrid.scheduler.lookupNow";

/// Ask the local scheduler to run orphan recovery. No body.
pub const LOOKUP_ORPHANS_NOW: &str = "chaingrid.scheduler.lookupOrphansNow";

/// Cancel a running process chain on whichever node runs it.
/// Body: [`CancelProcessChain`](crate::CancelProcessChain).
pub const CANCEL_PROCESS_CHAIN: &str = "chaingrid.scheduler.cancelProcessChain";

/// A cluster node has gone away. Body: [`NodeLeft`](crate::NodeLeft).
pub const CLUSTER_NODE_LEFT: &str = "chaingrid.cluster.nodeLeft";

/// No agent can serve a capability set. Body: [`AgentMissing`](crate::AgentMissing).
pub const REMOTE_AGENT_MISSING: &str = "chaingrid.remoteAgentRegistry.agentMissing";

/// An agent has started serving. Body: the agent's address as a string.
pub const REMOTE_AGENT_ADDED: &str = "chaingrid.remoteAgentRegistry.agentAdded";

/// An agent has stopped serving. Body: the agent's address as a string.
pub const REMOTE_AGENT_LEFT: &str = "chaingrid.remoteAgentRegistry.agentLeft";

/// Prefix of every agent address.
pub const REMOTE_AGENT_ADDRESS_PREFIX: &str = "chaingrid.agent.";

const SCHEDULER_ADDRESS_PREFIX: &str = "chaingrid.scheduler.";

/// Address at which an agent serves requests.
pub fn remote_agent_address(agent_id: &str) -> String {
    format!("{REMOTE_AGENT_ADDRESS_PREFIX}{agent_id}")
}

/// Inverse of [`remote_agent_address`].
pub fn agent_id_from_address(address: &str) -> Option<&str> {
    address
        .strip_prefix(REMOTE_AGENT_ADDRESS_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Address at which a scheduler answers with the ids of the process chains
/// it is running.
pub fn scheduler_running_address(scheduler_id: &str) -> String {
    format!("{SCHEDULER_ADDRESS_PREFIX}{scheduler_id}.runningProcessChains")
}
