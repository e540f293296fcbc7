//! chaingrid-state — submission and VM registries for ChainGrid.
//!
//! The [`SubmissionRegistry`] and [`VmRegistry`] traits are the contracts
//! the scheduler and cloud manager depend on. [`StateStore`] implements
//! both on top of [redb](https://docs.rs/redb), on disk or in memory.
//!
//! # Architecture
//!
//! ```text
//!   Scheduler ──► SubmissionRegistry ─┐
//!                                     ├──► StateStore ──► redb
//!   CloudManager ──► VmRegistry ──────┘
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Sequence-number tables record insertion order so that fetches hand out
//! the oldest matching record first.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::{SubmissionRegistry, VmRegistry};
pub use store::StateStore;
pub use types::*;
