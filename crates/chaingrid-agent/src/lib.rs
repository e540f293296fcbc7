//! chaingrid-agent — the things that execute process chains.
//!
//! # Architecture
//!
//! ```text
//!   Scheduler ──► RemoteAgentRegistry ──inquire/allocate──┐
//!        │                                                ▼
//!        └──execute──► RemoteAgent ──process──► AgentService ──► LocalAgent
//!                                               (one slot)      (child processes)
//! ```
//!
//! [`Agent`] runs a chain; [`AgentRegistry`] hands agents out to
//! schedulers. [`AgentService`] exposes any agent on the bus so remote
//! schedulers can allocate it.

pub mod agent;
pub mod error;
pub mod local;
pub mod remote;
pub mod service;

pub use agent::{Agent, AgentRegistry};
pub use error::{AgentError, AgentResult};
pub use local::LocalAgent;
pub use remote::{RemoteAgent, RemoteAgentRegistry};
pub use service::{AgentService, AgentServiceConfig};
