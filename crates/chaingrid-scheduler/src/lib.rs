//! chaingrid-scheduler — matches registered process chains to agents.
//!
//! # Architecture
//!
//! ```text
//!              lookupNow / timer
//!                     │
//!   SubmissionRegistry ◄──fetch next──  Scheduler ──select/allocate──► AgentRegistry
//!        ▲                                │  │
//!        └──── results, status ◄── execution task ──► Agent
//!                                         │
//!                     agentMissing ◄──────┘ (no candidates)
//! ```
//!
//! Several schedulers may share one registry. The registry's atomic
//! fetch-and-transition is the only thing keeping two of them from
//! running the same chain; everything the scheduler caches in memory is
//! advisory.

pub mod config;
pub mod error;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
