//! Scheduler — hands registered process chains to agents.
//!
//! Each lookup asks the agent registry for idle agents that can serve the
//! capability sets registered chains require, atomically takes the oldest
//! matching chain for every candidate and starts executing it. When no
//! agent is available the scheduler publishes `agentMissing` so the cloud
//! manager can add capacity.
//!
//! Orphan recovery finds chains marked RUNNING that no live scheduler
//! claims. Chains whose agent is still executing them are reattached to
//! that agent; all others are reset to REGISTERED.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chaingrid_agent::{Agent, AgentError, AgentRegistry, AgentResult};
use chaingrid_bus::addresses::{
    CANCEL_PROCESS_CHAIN, CLUSTER_NODE_LEFT, LOOKUP_NOW, LOOKUP_ORPHANS_NOW, REMOTE_AGENT_MISSING,
    remote_agent_address, scheduler_running_address,
};
use chaingrid_bus::{
    AgentInfo, AgentMissing, AgentRequest, BusError, CancelProcessChain, ClusterMap, EventBus,
    LookupNow, NodeLeft,
};
use chaingrid_state::{
    CapabilitySet, ProcessChain, ProcessChainId, ProcessChainResults, ProcessChainStatus,
    SubmissionRegistry,
};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;

/// A RUNNING chain that no scheduler tracks but whose agent still
/// executes it.
#[derive(Debug, Clone)]
struct Resumable {
    process_chain_id: ProcessChainId,
    agent_address: String,
}

#[derive(Default)]
struct LookupState {
    /// Lookup steps still owed to callers.
    pending: u64,
    update_required_capabilities: bool,
    in_flight: bool,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<dyn SubmissionRegistry>,
    agents: Arc<dyn AgentRegistry>,
    bus: EventBus,
    cluster: Arc<dyn ClusterMap>,
    lookup: Mutex<LookupState>,
    /// Capability sets of REGISTERED chains and how many chains need each.
    required_capabilities: Mutex<Vec<(CapabilitySet, u64)>>,
    /// Chains this instance is allocating or executing.
    running: RwLock<HashMap<ProcessChainId, CancellationToken>>,
    resume_queue: Mutex<Vec<Resumable>>,
    resume_pending: AtomicBool,
}

/// Matches registered process chains to agents. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<dyn SubmissionRegistry>,
        agents: Arc<dyn AgentRegistry>,
        bus: EventBus,
        cluster: Arc<dyn ClusterMap>,
    ) -> SchedulerResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                agents,
                bus,
                cluster,
                lookup: Mutex::new(LookupState::default()),
                required_capabilities: Mutex::new(Vec::new()),
                running: RwLock::new(HashMap::new()),
                resume_queue: Mutex::new(Vec::new()),
                resume_pending: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.config.agent_id
    }

    /// Ids of the chains this instance is currently allocating or running.
    pub async fn running_process_chain_ids(&self) -> Vec<ProcessChainId> {
        let mut ids: Vec<_> = self.inner.running.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Signal cancellation to a chain running on this instance. Returns
    /// false if it is not running here.
    pub async fn cancel_process_chain(&self, process_chain_id: &str) -> bool {
        match self.inner.running.read().await.get(process_chain_id) {
            Some(cancel) => {
                info!(%process_chain_id, "cancelling process chain");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// Run up to `max_lookups` allocation steps. If a lookup is already in
    /// flight the request is added to its budget and this call returns
    /// immediately.
    pub async fn lookup(&self, max_lookups: u64, update_required_capabilities: bool) {
        {
            let mut state = self.inner.lookup.lock().await;
            state.pending = state.pending.saturating_add(max_lookups.max(1));
            state.update_required_capabilities |= update_required_capabilities;
            if state.in_flight {
                return;
            }
            state.in_flight = true;
        }

        loop {
            let update = {
                let mut state = self.inner.lookup.lock().await;
                if state.pending == 0 {
                    state.in_flight = false;
                    return;
                }
                std::mem::take(&mut state.update_required_capabilities)
            };

            if update {
                if let Err(e) = self.update_required_capabilities().await {
                    error!(error = %e, "could not refresh required capabilities");
                }
            }

            let allocated = match self.lookup_step().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "lookup step failed");
                    0
                }
            };

            let mut state = self.inner.lookup.lock().await;
            if allocated == 0 {
                // Nothing more to do unless a refresh was asked for meanwhile.
                state.pending = u64::from(state.update_required_capabilities);
            } else {
                state.pending = state.pending.saturating_sub(1);
            }
        }
    }

    async fn update_required_capabilities(&self) -> SchedulerResult<()> {
        let registry = &self.inner.registry;
        let sets = registry
            .find_process_chain_required_capabilities(ProcessChainStatus::Registered)
            .await?;
        let mut entries = Vec::with_capacity(sets.len());
        for capabilities in sets {
            let n = registry
                .count_process_chains(ProcessChainStatus::Registered, Some(&capabilities))
                .await?;
            if n > 0 {
                entries.push((capabilities, n));
            }
        }
        debug!(sets = entries.len(), "required capabilities refreshed");
        *self.inner.required_capabilities.lock().await = entries;
        Ok(())
    }

    /// One allocation round. Returns the number of chains started.
    pub async fn lookup_step(&self) -> SchedulerResult<usize> {
        let mut allocated = self.resume_orphans().await;

        let required = self.inner.required_capabilities.lock().await.clone();
        if required.is_empty() {
            return Ok(allocated);
        }

        let candidates = self.inner.agents.select_candidates(&required).await?;
        if candidates.is_empty() {
            self.publish_agent_missing(required).await?;
            return Ok(allocated);
        }

        for (capabilities, address) in candidates {
            let Some(process_chain) = self
                .inner
                .registry
                .fetch_next_process_chain(
                    ProcessChainStatus::Registered,
                    ProcessChainStatus::Running,
                    Some(&capabilities),
                )
                .await?
            else {
                self.inner
                    .required_capabilities
                    .lock()
                    .await
                    .retain(|(c, _)| *c != capabilities);
                continue;
            };

            let cancel = self.track(&process_chain.id).await;
            let agent = match self
                .inner
                .agents
                .try_allocate(&address, &process_chain.id)
                .await
            {
                Ok(Some(agent)) => agent,
                Ok(None) => {
                    debug!(process_chain_id = %process_chain.id, %address, "agent was taken, returning process chain");
                    self.give_back(&process_chain.id).await;
                    continue;
                }
                Err(e) => {
                    warn!(process_chain_id = %process_chain.id, %address, error = %e, "allocation failed, returning process chain");
                    self.give_back(&process_chain.id).await;
                    continue;
                }
            };

            info!(process_chain_id = %process_chain.id, agent = %agent.id(), "process chain allocated");
            self.launch(process_chain, agent, cancel, false);
            allocated += 1;

            // One chain of this set fewer is waiting.
            if let Some((_, n)) = self
                .inner
                .required_capabilities
                .lock()
                .await
                .iter_mut()
                .find(|(c, _)| *c == capabilities)
            {
                *n = n.saturating_sub(1);
            }
        }
        Ok(allocated)
    }

    async fn publish_agent_missing(
        &self,
        required: Vec<(CapabilitySet, u64)>,
    ) -> SchedulerResult<()> {
        let mut remaining = Vec::with_capacity(required.len());
        for (capabilities, n) in required {
            if self
                .inner
                .registry
                .exists_process_chain(ProcessChainStatus::Registered, Some(&capabilities))
                .await?
            {
                remaining.push((capabilities, n));
            }
        }
        for (capabilities, n) in &remaining {
            debug!(required_capabilities = %capabilities, n, "no agent available");
            self.inner
                .bus
                .publish_as(
                    REMOTE_AGENT_MISSING,
                    &AgentMissing {
                        n: *n,
                        required_capabilities: capabilities.clone(),
                    },
                )
                .await?;
        }
        *self.inner.required_capabilities.lock().await = remaining;
        Ok(())
    }

    async fn track(&self, process_chain_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.inner
            .running
            .write()
            .await
            .insert(process_chain_id.to_string(), cancel.clone());
        cancel
    }

    /// Undo a fetch whose allocation failed.
    async fn give_back(&self, process_chain_id: &str) {
        self.inner.running.write().await.remove(process_chain_id);
        if let Err(e) = self
            .inner
            .registry
            .set_process_chain_status(
                process_chain_id,
                ProcessChainStatus::Registered,
                Some(ProcessChainStatus::Running),
            )
            .await
        {
            error!(%process_chain_id, error = %e, "could not return process chain to REGISTERED");
        }
    }

    // ── Execution ──────────────────────────────────────────────────

    fn launch(
        &self,
        process_chain: ProcessChain,
        agent: Arc<dyn Agent>,
        cancel: CancellationToken,
        resumed: bool,
    ) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let process_chain_id = process_chain.id.clone();
            let body = tokio::spawn({
                let scheduler = scheduler.clone();
                let agent = agent.clone();
                async move {
                    scheduler
                        .execute(process_chain, agent, cancel, resumed)
                        .await
                }
            });
            if let Err(e) = body.await {
                error!(%process_chain_id, error = %e, "execution task panicked");
            }
            scheduler.finish(&process_chain_id, agent.as_ref()).await;
        });
    }

    async fn execute(
        &self,
        process_chain: ProcessChain,
        agent: Arc<dyn Agent>,
        cancel: CancellationToken,
        resumed: bool,
    ) {
        let id = process_chain.id.as_str();
        if !resumed {
            if let Err(e) = self
                .inner
                .registry
                .set_process_chain_start_time(id, Some(Utc::now()))
                .await
            {
                warn!(process_chain_id = %id, error = %e, "could not record start time");
            }
        }
        debug!(process_chain_id = %id, agent = %agent.id(), resumed, "executing process chain");

        let outcome = agent.execute(&process_chain, cancel).await;
        if let Err(e) = self.record_outcome(id, outcome).await {
            error!(process_chain_id = %id, error = %e, "could not record outcome");
        }
    }

    async fn record_outcome(
        &self,
        id: &str,
        outcome: AgentResult<ProcessChainResults>,
    ) -> SchedulerResult<()> {
        let registry = &self.inner.registry;
        let status = match outcome {
            Ok(results) => {
                registry.set_process_chain_results(id, Some(results)).await?;
                ProcessChainStatus::Success
            }
            Err(AgentError::Cancelled) => ProcessChainStatus::Cancelled,
            Err(e) => {
                let message = match e {
                    AgentError::Execution(message) => message,
                    other => other.to_string(),
                };
                registry
                    .set_process_chain_error_message(id, Some(message))
                    .await?;
                ProcessChainStatus::Error
            }
        };

        let applied = registry
            .set_process_chain_status(id, status, Some(ProcessChainStatus::Running))
            .await?;
        if applied {
            info!(process_chain_id = %id, %status, "process chain finished");
        } else {
            debug!(process_chain_id = %id, %status, "process chain already left RUNNING, outcome dropped");
        }
        Ok(())
    }

    async fn finish(&self, process_chain_id: &str, agent: &dyn Agent) {
        if let Err(e) = self.inner.agents.deallocate(agent).await {
            warn!(%process_chain_id, agent = %agent.id(), error = %e, "could not deallocate agent");
        }
        if let Err(e) = self
            .inner
            .registry
            .set_process_chain_end_time(process_chain_id, Some(Utc::now()))
            .await
        {
            warn!(%process_chain_id, error = %e, "could not record end time");
        }
        self.inner.running.write().await.remove(process_chain_id);

        // The agent is free again; use it right away.
        let next = LookupNow {
            max_lookups: 1,
            update_required_capabilities: false,
        };
        if let Err(e) = self.inner.bus.publish_as(LOOKUP_NOW, &next).await {
            warn!(error = %e, "could not request lookup");
        }
    }

    // ── Orphans ────────────────────────────────────────────────────

    /// Find RUNNING chains no live scheduler claims. Failures are logged
    /// and the pass is abandoned until the next trigger.
    pub async fn lookup_orphans(&self) {
        if self.inner.resume_pending.load(Ordering::SeqCst) {
            debug!("previous orphans still waiting to be resumed");
            return;
        }
        if let Err(e) = self.try_lookup_orphans().await {
            warn!(error = %e, "orphan lookup failed, retrying later");
        }
    }

    async fn try_lookup_orphans(&self) -> SchedulerResult<()> {
        let registry = &self.inner.registry;
        let running = registry
            .find_process_chain_ids_by_status(ProcessChainStatus::Running)
            .await?;
        if running.is_empty() {
            return Ok(());
        }

        let claimed = self.claimed_process_chain_ids().await?;
        let unclaimed: Vec<_> = running
            .into_iter()
            .filter(|id| !claimed.contains(id))
            .collect();
        if unclaimed.is_empty() {
            return Ok(());
        }

        // Chains may have finished while the other schedulers answered.
        let still_running: HashSet<_> = registry
            .find_process_chain_ids_by_status(ProcessChainStatus::Running)
            .await?
            .into_iter()
            .collect();
        let candidates: Vec<_> = unclaimed
            .into_iter()
            .filter(|id| still_running.contains(id))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let executing = self.process_chains_on_agents().await?;
        let mut resumable = Vec::new();
        let mut reset = 0;
        for id in candidates {
            match executing.get(&id) {
                Some(address) => resumable.push(Resumable {
                    process_chain_id: id,
                    agent_address: address.clone(),
                }),
                None => {
                    if self.reset_orphan(&id).await? {
                        warn!(process_chain_id = %id, "orphaned process chain reset to REGISTERED");
                        reset += 1;
                    }
                }
            }
        }

        let found = !resumable.is_empty();
        if found {
            info!(count = resumable.len(), "found process chains to resume");
            self.inner.resume_queue.lock().await.extend(resumable);
            self.inner.resume_pending.store(true, Ordering::SeqCst);
        }
        if found || reset > 0 {
            self.inner
                .bus
                .publish_as(
                    LOOKUP_NOW,
                    &LookupNow {
                        max_lookups: u64::MAX,
                        update_required_capabilities: true,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Chains claimed by this instance or any other live scheduler.
    async fn claimed_process_chain_ids(&self) -> SchedulerResult<HashSet<ProcessChainId>> {
        let mut claimed: HashSet<_> = self.running_process_chain_ids().await.into_iter().collect();
        for instance in self.inner.cluster.keys().await? {
            if instance == self.inner.config.agent_id {
                continue;
            }
            let ids: Vec<ProcessChainId> = self
                .inner
                .bus
                .request_as(
                    &scheduler_running_address(&instance),
                    &Value::Null,
                    self.inner.config.request_timeout,
                )
                .await?;
            claimed.extend(ids);
        }
        Ok(claimed)
    }

    /// Map of chain id to the address of the agent reporting it.
    async fn process_chains_on_agents(&self) -> SchedulerResult<HashMap<ProcessChainId, String>> {
        let mut executing = HashMap::new();
        for agent_id in self.inner.agents.get_agent_ids().await? {
            let address = remote_agent_address(&agent_id);
            let info: AgentInfo = match self
                .inner
                .bus
                .request_as(&address, &AgentRequest::Info, self.inner.config.request_timeout)
                .await
            {
                Ok(info) => info,
                Err(BusError::NoHandler(_)) => {
                    debug!(agent = %agent_id, "agent is gone");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if let Some(process_chain_id) = info.process_chain_id {
                executing.insert(process_chain_id, address);
            }
        }
        Ok(executing)
    }

    async fn reset_orphan(&self, process_chain_id: &str) -> SchedulerResult<bool> {
        let registry = &self.inner.registry;
        let applied = registry
            .set_process_chain_status(
                process_chain_id,
                ProcessChainStatus::Registered,
                Some(ProcessChainStatus::Running),
            )
            .await?;
        if applied {
            registry
                .set_process_chain_start_time(process_chain_id, None)
                .await?;
        }
        Ok(applied)
    }

    /// Reattach queued orphans to the agents still executing them.
    async fn resume_orphans(&self) -> usize {
        let queue = std::mem::take(&mut *self.inner.resume_queue.lock().await);
        if queue.is_empty() {
            return 0;
        }
        let mut resumed = 0;
        for entry in queue {
            match self.resume(&entry).await {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(process_chain_id = %entry.process_chain_id, error = %e, "could not resume process chain")
                }
            }
        }
        self.inner.resume_pending.store(false, Ordering::SeqCst);
        resumed
    }

    async fn resume(&self, entry: &Resumable) -> SchedulerResult<bool> {
        let registry = &self.inner.registry;
        let id = entry.process_chain_id.as_str();
        let Some(process_chain) = registry.find_process_chain_by_id(id).await? else {
            return Ok(false);
        };
        if registry.get_process_chain_status(id).await? != ProcessChainStatus::Running
            || self.inner.running.read().await.contains_key(id)
        {
            return Ok(false);
        }

        let cancel = self.track(id).await;
        match self
            .inner
            .agents
            .try_allocate(&entry.agent_address, id)
            .await
        {
            Ok(Some(agent)) => {
                info!(process_chain_id = %id, agent = %agent.id(), "resuming process chain");
                self.launch(process_chain, agent, cancel, true);
                Ok(true)
            }
            Ok(None) | Err(_) => {
                // The agent moved on, start over.
                self.inner.running.write().await.remove(id);
                if self.reset_orphan(id).await? {
                    warn!(process_chain_id = %id, "agent no longer holds process chain, reset to REGISTERED");
                }
                Ok(false)
            }
        }
    }

    // ── Event loop ─────────────────────────────────────────────────

    fn spawn_lookup(&self, max_lookups: u64, update_required_capabilities: bool) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler
                .lookup(max_lookups, update_required_capabilities)
                .await
        });
    }

    fn spawn_lookup_orphans(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.lookup_orphans().await });
    }

    async fn on_node_left(&self, body: Value) {
        let left: NodeLeft = match serde_json::from_value(body) {
            Ok(left) => left,
            Err(e) => {
                warn!(error = %e, "ignoring malformed node-left message");
                return;
            }
        };
        if left.agent_id == self.inner.config.agent_id {
            return;
        }
        info!(node = %left.agent_id, "cluster node left, looking for orphans");
        if let Err(e) = self.inner.cluster.remove(&left.agent_id).await {
            warn!(node = %left.agent_id, error = %e, "could not remove scheduler from cluster map");
        }
        self.spawn_lookup_orphans();
    }

    /// Serve the scheduler until `shutdown` flips: periodic and requested
    /// lookups, orphan recovery, running-chain queries and cancellations.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        let id = self.inner.config.agent_id.clone();
        let bus = self.inner.bus.clone();
        let running_address = scheduler_running_address(&id);

        let mut running_requests = bus.register(&running_address).await;
        let mut lookup_now = bus.subscribe(LOOKUP_NOW).await;
        let mut lookup_orphans_now = bus.subscribe(LOOKUP_ORPHANS_NOW).await;
        let mut node_left = bus.subscribe(CLUSTER_NODE_LEFT).await;
        let mut cancellations = bus.subscribe(CANCEL_PROCESS_CHAIN).await;
        self.inner.cluster.put(&id, &running_address).await?;
        info!(scheduler = %id, "scheduler started");

        let config = &self.inner.config;
        let mut lookup_timer = tokio::time::interval(config.lookup_interval);
        let mut orphans_timer = tokio::time::interval_at(
            Instant::now() + config.lookup_orphans_initial_delay,
            config.lookup_orphans_interval,
        );

        loop {
            tokio::select! {
                _ = lookup_timer.tick() => self.spawn_lookup(u64::MAX, true),
                _ = orphans_timer.tick() => self.spawn_lookup_orphans(),
                msg = lookup_now.recv() => match msg {
                    Some(body) => match serde_json::from_value::<LookupNow>(body) {
                        Ok(request) => {
                            self.spawn_lookup(request.max_lookups, request.update_required_capabilities)
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed lookup request"),
                    },
                    None => break,
                },
                msg = lookup_orphans_now.recv() => match msg {
                    Some(_) => self.spawn_lookup_orphans(),
                    None => break,
                },
                msg = node_left.recv() => match msg {
                    Some(body) => self.on_node_left(body).await,
                    None => break,
                },
                msg = cancellations.recv() => match msg {
                    Some(body) => match serde_json::from_value::<CancelProcessChain>(body) {
                        Ok(request) => {
                            self.cancel_process_chain(&request.process_chain_id).await;
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed cancel request"),
                    },
                    None => break,
                },
                envelope = running_requests.recv() => match envelope {
                    Some(envelope) => {
                        let ids = self.running_process_chain_ids().await;
                        envelope.into_parts().1.reply_with(&ids);
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    info!(scheduler = %id, "scheduler shutting down");
                    break;
                }
            }
        }

        bus.unregister(&running_address).await;
        if let Err(e) = self.inner.cluster.remove(&id).await {
            warn!(scheduler = %id, error = %e, "could not deregister scheduler");
        }
        Ok(())
    }
}
