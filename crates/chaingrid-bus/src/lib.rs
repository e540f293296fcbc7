//! chaingrid-bus — messaging between schedulers, agents and the cloud
//! manager.
//!
//! # Architecture
//!
//! ```text
//!   Scheduler ──publish──► agentMissing ──► CloudManager
//!       │                                       │
//!       ├──request──► chaingrid.agent.<id> ◄────┤ keepAlive
//!       │                  (AgentService)       │
//!       └──request──► scheduler.<id>.runningProcessChains
//! ```
//!
//! [`EventBus`] carries JSON bodies over a [`BusTransport`], in-process by
//! default. [`messages`] holds their typed forms and [`addresses`] the
//! well-known addresses. [`ClusterMap`] tracks which scheduler instances
//! are alive.

pub mod addresses;
pub mod bus;
pub mod cluster;
pub mod error;
pub mod messages;

pub use bus::{
    BusTransport, Envelope, EventBus, Handler, LocalTransport, Responder, Subscription,
};
pub use cluster::{ClusterMap, InMemoryClusterMap};
pub use error::{BusError, BusResult};
pub use messages::*;
