//! AgentService — serves an executor at an agent address on the bus.
//!
//! The service owns the agent's allocation slot: it accepts one process
//! chain at a time, runs it on the wrapped executor, and answers info and
//! inquiry requests from any scheduler. It frees itself when a scheduler
//! allocates it and then goes silent, and (for cloud agents) leaves the
//! cluster after staying idle without keep-alives.

use std::sync::Arc;
use std::time::Duration;

use chaingrid_bus::addresses::{REMOTE_AGENT_ADDED, REMOTE_AGENT_LEFT, remote_agent_address};
use chaingrid_bus::{
    AgentInfo, AgentRequest, AllocateReply, CapabilityDemand, Envelope, EventBus, InquiryReply,
    ProcessReply, Responder,
};
use chaingrid_state::{CapabilitySet, ProcessChain};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::error::AgentError;

/// Settings for one agent service.
#[derive(Debug, Clone)]
pub struct AgentServiceConfig {
    pub id: String,
    pub capabilities: CapabilitySet,
    /// How long an allocation may go unused (or a finished result
    /// uncollected) before the agent frees itself.
    pub busy_timeout: Duration,
    /// Leave the cluster after this long idle without a keep-alive.
    /// `None` keeps the agent forever.
    pub auto_shutdown_timeout: Option<Duration>,
    /// How often timeouts are checked.
    pub check_interval: Duration,
}

impl AgentServiceConfig {
    pub fn new(id: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            id: id.into(),
            capabilities,
            busy_timeout: Duration::from_secs(60),
            auto_shutdown_timeout: None,
            check_interval: Duration::from_secs(1),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_auto_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.auto_shutdown_timeout = Some(timeout);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

enum Slot {
    Idle {
        since: Instant,
    },
    Allocated {
        process_chain_id: String,
        since: Instant,
    },
    Executing {
        process_chain_id: String,
        cancel: CancellationToken,
        outcome: watch::Receiver<Option<ProcessReply>>,
        finished_at: Option<Instant>,
    },
}

impl Slot {
    fn idle() -> Self {
        Slot::Idle {
            since: Instant::now(),
        }
    }

    fn process_chain_id(&self) -> Option<&str> {
        match self {
            Slot::Idle { .. } => None,
            Slot::Allocated {
                process_chain_id, ..
            }
            | Slot::Executing {
                process_chain_id, ..
            } => Some(process_chain_id),
        }
    }
}

/// Pick the capability set an idle agent should serve: the one with the
/// most waiting chains among those it can satisfy (first wins ties).
pub fn best_capability_index(
    provided: &CapabilitySet,
    required: &[CapabilityDemand],
) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, demand) in required.iter().enumerate() {
        if !provided.is_superset_of(&demand.capabilities) {
            continue;
        }
        if best.is_none_or(|(_, count)| demand.count > count) {
            best = Some((i, demand.count));
        }
    }
    best.map(|(i, _)| i)
}

/// Serves an executor on the bus until shut down or idle too long.
pub struct AgentService {
    config: AgentServiceConfig,
    executor: Arc<dyn Agent>,
    bus: EventBus,
}

impl AgentService {
    pub fn new(config: AgentServiceConfig, executor: Arc<dyn Agent>, bus: EventBus) -> Self {
        Self {
            config,
            executor,
            bus,
        }
    }

    /// Register at the agent address, announce the agent, and serve
    /// requests until `shutdown` flips or the idle timeout expires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let address = remote_agent_address(&self.config.id);
        let mut handler = self.bus.register(&address).await;
        self.bus
            .publish(REMOTE_AGENT_ADDED, Value::String(address.clone()))
            .await;
        info!(agent = %self.config.id, capabilities = %self.config.capabilities, "agent started");

        let (done_tx, mut done_rx) = mpsc::channel::<String>(16);
        let mut slot = Slot::idle();
        let mut last_keep_alive = Instant::now();
        let mut ticker = tokio::time::interval(self.config.check_interval);

        loop {
            tokio::select! {
                envelope = handler.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.handle(envelope, &mut slot, &mut last_keep_alive, &done_tx);
                }
                Some(finished) = done_rx.recv() => {
                    if let Slot::Executing { process_chain_id, finished_at, .. } = &mut slot {
                        if *process_chain_id == finished {
                            *finished_at = Some(Instant::now());
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.expire(&mut slot, last_keep_alive) {
                        info!(agent = %self.config.id, "idle without keep-alive, leaving");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!(agent = %self.config.id, "agent shutting down");
                    break;
                }
            }
        }

        if let Slot::Executing { cancel, .. } = &slot {
            cancel.cancel();
        }
        self.bus.unregister(&address).await;
        self.bus
            .publish(REMOTE_AGENT_LEFT, Value::String(address))
            .await;
    }

    fn info(&self, slot: &Slot) -> AgentInfo {
        AgentInfo {
            id: self.config.id.clone(),
            available: matches!(slot, Slot::Idle { .. }),
            capabilities: self.config.capabilities.clone(),
            process_chain_id: slot.process_chain_id().map(str::to_string),
        }
    }

    fn handle(
        &self,
        envelope: Envelope,
        slot: &mut Slot,
        last_keep_alive: &mut Instant,
        done_tx: &mpsc::Sender<String>,
    ) {
        let request: Result<AgentRequest, _> = envelope.parse();
        let (_, responder) = envelope.into_parts();
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                responder.fail(format!("invalid request: {e}"));
                return;
            }
        };

        match request {
            AgentRequest::Info => responder.reply_with(&self.info(slot)),
            AgentRequest::Inquire {
                required_capabilities,
            } => {
                let idle = matches!(slot, Slot::Idle { .. });
                let best = idle
                    .then(|| best_capability_index(&self.config.capabilities, &required_capabilities))
                    .flatten();
                responder.reply_with(&InquiryReply {
                    available: best.is_some(),
                    best_required_capabilities: best,
                });
            }
            AgentRequest::Allocate { process_chain_id } => {
                let accepted = match &*slot {
                    Slot::Idle { .. } => true,
                    other => other.process_chain_id() == Some(process_chain_id.as_str()),
                };
                if accepted && !matches!(slot, Slot::Executing { .. }) {
                    *slot = Slot::Allocated {
                        process_chain_id: process_chain_id.clone(),
                        since: Instant::now(),
                    };
                }
                debug!(agent = %self.config.id, %process_chain_id, accepted, "allocation requested");
                responder.reply_with(&AllocateReply { accepted });
            }
            AgentRequest::Deallocate => {
                if let Slot::Executing {
                    cancel,
                    finished_at: None,
                    ..
                } = slot
                {
                    cancel.cancel();
                }
                *slot = Slot::idle();
                responder.reply(Value::Null);
            }
            AgentRequest::Process { process_chain } => {
                self.process(process_chain, slot, responder, done_tx);
            }
            AgentRequest::Cancel => {
                if let Slot::Executing { cancel, .. } = slot {
                    cancel.cancel();
                }
                responder.reply(Value::Null);
            }
            AgentRequest::KeepAlive => {
                *last_keep_alive = Instant::now();
                responder.reply(Value::Null);
            }
        }
    }

    fn process(
        &self,
        process_chain: ProcessChain,
        slot: &mut Slot,
        responder: Responder,
        done_tx: &mpsc::Sender<String>,
    ) {
        match slot {
            Slot::Allocated {
                process_chain_id, ..
            } if *process_chain_id == process_chain.id => {
                let cancel = CancellationToken::new();
                let (outcome_tx, outcome_rx) = watch::channel(None);
                let executor = self.executor.clone();
                let done_tx = done_tx.clone();
                let token = cancel.clone();
                let id = process_chain.id.clone();
                tokio::spawn(async move {
                    let outcome = match executor.execute(&process_chain, token).await {
                        Ok(results) => ProcessReply::Success { results },
                        Err(AgentError::Cancelled) => ProcessReply::Cancelled,
                        Err(e) => ProcessReply::Error {
                            message: e.to_string(),
                        },
                    };
                    let _ = outcome_tx.send(Some(outcome));
                    let _ = done_tx.send(process_chain.id).await;
                });
                info!(agent = %self.config.id, process_chain_id = %id, "executing process chain");
                tokio::spawn(reply_when_done(outcome_rx.clone(), responder));
                *slot = Slot::Executing {
                    process_chain_id: id,
                    cancel,
                    outcome: outcome_rx,
                    finished_at: None,
                };
            }
            Slot::Executing {
                process_chain_id,
                outcome,
                ..
            } if *process_chain_id == process_chain.id => {
                info!(agent = %self.config.id, process_chain_id = %process_chain.id, "reattaching to running process chain");
                tokio::spawn(reply_when_done(outcome.clone(), responder));
            }
            _ => responder.fail(format!(
                "agent {} is not allocated to process chain {}",
                self.config.id, process_chain.id
            )),
        }
    }

    /// Apply busy and idle timeouts. Returns true if the agent should leave.
    fn expire(&self, slot: &mut Slot, last_keep_alive: Instant) -> bool {
        let busy_timeout = self.config.busy_timeout;
        match slot {
            Slot::Allocated {
                process_chain_id,
                since,
            } if since.elapsed() >= busy_timeout => {
                warn!(agent = %self.config.id, %process_chain_id, "allocation was never used, freeing agent");
                *slot = Slot::idle();
                false
            }
            Slot::Executing {
                process_chain_id,
                finished_at: Some(at),
                ..
            } if at.elapsed() >= busy_timeout => {
                warn!(agent = %self.config.id, %process_chain_id, "result was never collected, freeing agent");
                *slot = Slot::idle();
                false
            }
            Slot::Idle { since } => self
                .config
                .auto_shutdown_timeout
                .is_some_and(|t| since.elapsed() >= t && last_keep_alive.elapsed() >= t),
            _ => false,
        }
    }
}

async fn reply_when_done(mut outcome: watch::Receiver<Option<ProcessReply>>, responder: Responder) {
    let result = outcome
        .wait_for(Option::is_some)
        .await
        .map(|o| o.clone());
    match result {
        Ok(Some(reply)) => responder.reply_with(&reply),
        _ => responder.fail("execution ended without an outcome"),
    }
}
