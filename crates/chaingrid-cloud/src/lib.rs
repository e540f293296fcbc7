//! chaingrid-cloud — VMs on demand for remote agents.
//!
//! # Architecture
//!
//! ```text
//!   agentMissing ──► CloudManager ──select──► SetupSelector ──► VmRegistry
//!   sync timer  ──►      │
//!                        ├──► CloudClient   (image, block device, VM)
//!                        └──► SshConnector  (upload + run provisioning scripts)
//!                                  │
//!                                  ▼
//!                        agent on the VM announces agentAdded
//! ```
//!
//! The [`SetupSelector`] decides which [`Setup`](chaingrid_state::Setup)s
//! to instantiate, bounded by per-setup limits and agent pool quotas. The
//! [`CloudManager`] turns those decisions into provisioned VMs and
//! retires VMs whose agents have left.

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod selector;
pub mod ssh;

pub use client::{CloudClient, Metadata};
pub use config::{CloudConfig, SshConfig, load_setups, parse_setups, validate_setups};
pub use error::{CloudError, CloudResult};
pub use manager::CloudManager;
pub use selector::SetupSelector;
pub use ssh::{OpenSshConnector, SshClient, SshConnector};
