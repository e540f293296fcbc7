//! Bus-backed agent registry and the client handle for remote agents.
//!
//! The registry learns about agents from `agentAdded`/`agentLeft`
//! publications and talks to each agent at its own address. Allocation is
//! decided by the agent itself, so two schedulers racing for the same
//! agent cannot both win.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chaingrid_bus::addresses::{
    REMOTE_AGENT_ADDED, REMOTE_AGENT_LEFT, agent_id_from_address, remote_agent_address,
};
use chaingrid_bus::{
    AgentRequest, AllocateReply, BusError, CapabilityDemand, EventBus, InquiryReply, ProcessReply,
};
use chaingrid_state::{CapabilitySet, ProcessChain, ProcessChainResults};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentRegistry};
use crate::error::{AgentError, AgentResult};

/// Default timeout for short agent requests (info, inquire, allocate).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn encode(request: &AgentRequest) -> AgentResult<Value> {
    serde_json::to_value(request).map_err(|e| AgentError::Protocol(e.to_string()))
}

// ── Remote agent handle ────────────────────────────────────────────

/// Handle to an allocated agent reachable over the bus.
pub struct RemoteAgent {
    id: String,
    address: String,
    bus: EventBus,
    request_timeout: Duration,
}

impl RemoteAgent {
    pub fn new(id: impl Into<String>, bus: EventBus) -> Self {
        let id = id.into();
        Self {
            address: remote_agent_address(&id),
            id,
            bus,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Agent for RemoteAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        process_chain: &ProcessChain,
        cancel: CancellationToken,
    ) -> AgentResult<ProcessChainResults> {
        let body = encode(&AgentRequest::Process {
            process_chain: process_chain.clone(),
        })?;
        tokio::select! {
            reply = self.bus.call(&self.address, body) => {
                let reply = reply.map_err(|e| match e {
                    BusError::Failed(message) => AgentError::Rejected(message),
                    other => other.into(),
                })?;
                let reply: ProcessReply = serde_json::from_value(reply)
                    .map_err(|e| AgentError::Protocol(e.to_string()))?;
                match reply {
                    ProcessReply::Success { results } => Ok(results),
                    ProcessReply::Error { message } => Err(AgentError::Execution(message)),
                    ProcessReply::Cancelled => Err(AgentError::Cancelled),
                }
            }
            _ = cancel.cancelled() => {
                let body = encode(&AgentRequest::Cancel)?;
                if let Err(e) = self.bus.request(&self.address, body, self.request_timeout).await {
                    warn!(agent = %self.id, process_chain_id = %process_chain.id, error = %e, "could not forward cancellation");
                }
                Err(AgentError::Cancelled)
            }
        }
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// [`AgentRegistry`] over agents that announce themselves on the bus.
#[derive(Clone)]
pub struct RemoteAgentRegistry {
    bus: EventBus,
    agents: Arc<RwLock<BTreeSet<String>>>,
    request_timeout: Duration,
    rotation: Arc<AtomicUsize>,
}

impl RemoteAgentRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            agents: Arc::new(RwLock::new(BTreeSet::new())),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            rotation: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Follow agent announcements. Subscriptions are in place when this
    /// returns, so agents started afterwards are never missed.
    pub async fn start(&self) -> JoinHandle<()> {
        let mut added = self.bus.subscribe(REMOTE_AGENT_ADDED).await;
        let mut left = self.bus.subscribe(REMOTE_AGENT_LEFT).await;
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = added.recv() => match msg {
                        Some(Value::String(address)) => registry.add_agent(&address).await,
                        Some(other) => warn!(body = %other, "ignoring malformed agent-added message"),
                        None => break,
                    },
                    msg = left.recv() => match msg {
                        Some(Value::String(address)) => registry.remove_agent(&address).await,
                        Some(other) => warn!(body = %other, "ignoring malformed agent-left message"),
                        None => break,
                    },
                }
            }
        })
    }

    pub async fn add_agent(&self, address: &str) {
        let Some(id) = agent_id_from_address(address) else {
            warn!(%address, "not an agent address");
            return;
        };
        if self.agents.write().await.insert(id.to_string()) {
            info!(agent = %id, "agent added");
        }
    }

    pub async fn remove_agent(&self, address: &str) {
        let Some(id) = agent_id_from_address(address) else {
            return;
        };
        if self.agents.write().await.remove(id) {
            info!(agent = %id, "agent left");
        }
    }

    /// Agent ids in a rotating order so no agent is always asked first.
    async fn rotated_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.iter().cloned().collect();
        if !ids.is_empty() {
            let start = self.rotation.fetch_add(1, Ordering::Relaxed) % ids.len();
            ids.rotate_left(start);
        }
        ids
    }

    async fn forget_if_gone(&self, address: &str, error: &BusError) {
        if matches!(error, BusError::NoHandler(_)) {
            self.remove_agent(address).await;
        }
    }
}

#[async_trait]
impl AgentRegistry for RemoteAgentRegistry {
    async fn select_candidates(
        &self,
        required: &[(CapabilitySet, u64)],
    ) -> AgentResult<Vec<(CapabilitySet, String)>> {
        if required.is_empty() {
            return Ok(Vec::new());
        }
        let inquiry = AgentRequest::Inquire {
            required_capabilities: required
                .iter()
                .map(|(capabilities, count)| CapabilityDemand {
                    capabilities: capabilities.clone(),
                    count: *count,
                })
                .collect(),
        };
        // Counts are a hint; always allow at least one agent per set.
        let mut remaining: Vec<u64> = required.iter().map(|(_, n)| (*n).max(1)).collect();

        let mut candidates = Vec::new();
        for id in self.rotated_ids().await {
            if remaining.iter().all(|n| *n == 0) {
                break;
            }
            let address = remote_agent_address(&id);
            let reply: InquiryReply = match self
                .bus
                .request_as(&address, &inquiry, self.request_timeout)
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(agent = %id, error = %e, "agent did not answer inquiry");
                    self.forget_if_gone(&address, &e).await;
                    continue;
                }
            };
            let Some(index) = reply.best_required_capabilities.filter(|_| reply.available) else {
                continue;
            };
            match remaining.get_mut(index) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    candidates.push((required[index].0.clone(), address));
                }
                Some(_) => {}
                None => warn!(agent = %id, index, "agent chose an unknown capability set"),
            }
        }
        debug!(candidates = candidates.len(), "candidates selected");
        Ok(candidates)
    }

    async fn try_allocate(
        &self,
        address: &str,
        process_chain_id: &str,
    ) -> AgentResult<Option<Arc<dyn Agent>>> {
        let Some(id) = agent_id_from_address(address) else {
            return Err(AgentError::Protocol(format!("not an agent address: {address}")));
        };
        let request = AgentRequest::Allocate {
            process_chain_id: process_chain_id.to_string(),
        };
        let reply: AllocateReply = match self
            .bus
            .request_as(address, &request, self.request_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(agent = %id, %process_chain_id, error = %e, "allocation request failed");
                self.forget_if_gone(address, &e).await;
                return Ok(None);
            }
        };
        if !reply.accepted {
            debug!(agent = %id, %process_chain_id, "agent already taken");
            return Ok(None);
        }
        let agent = RemoteAgent::new(id, self.bus.clone()).with_request_timeout(self.request_timeout);
        Ok(Some(Arc::new(agent)))
    }

    async fn deallocate(&self, agent: &dyn Agent) -> AgentResult<()> {
        let address = remote_agent_address(agent.id());
        let body = encode(&AgentRequest::Deallocate)?;
        self.bus
            .request(&address, body, self.request_timeout)
            .await?;
        Ok(())
    }

    async fn get_agent_ids(&self) -> AgentResult<Vec<String>> {
        Ok(self.agents.read().await.iter().cloned().collect())
    }
}
