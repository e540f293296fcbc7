//! Agent and agent registry contracts.

use std::sync::Arc;

use async_trait::async_trait;
use chaingrid_state::{CapabilitySet, ProcessChain, ProcessChainResults};
use tokio_util::sync::CancellationToken;

use crate::error::AgentResult;

/// Something that can run a process chain.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Run every executable of `process_chain` in order. Returns
    /// [`AgentError::Cancelled`](crate::AgentError::Cancelled) if `cancel`
    /// fires first.
    async fn execute(
        &self,
        process_chain: &ProcessChain,
        cancel: CancellationToken,
    ) -> AgentResult<ProcessChainResults>;
}

/// Tracks available agents and hands them out one process chain at a time.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Given capability sets and the number of chains waiting for each,
    /// return `(capabilities, agent address)` pairs of idle agents able to
    /// serve them. Each agent appears at most once.
    async fn select_candidates(
        &self,
        required: &[(CapabilitySet, u64)],
    ) -> AgentResult<Vec<(CapabilitySet, String)>>;

    /// Reserve the agent at `address` for a process chain. `None` means
    /// another caller got it first.
    async fn try_allocate(
        &self,
        address: &str,
        process_chain_id: &str,
    ) -> AgentResult<Option<Arc<dyn Agent>>>;

    /// Release an agent obtained from [`try_allocate`](Self::try_allocate).
    async fn deallocate(&self, agent: &dyn Agent) -> AgentResult<()>;

    async fn get_agent_ids(&self) -> AgentResult<Vec<String>>;
}
