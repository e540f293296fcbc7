//! Registry contracts shared by the scheduler and the cloud manager.
//!
//! Status setters that take an expected status are compare-and-set
//! operations: they return `Ok(true)` if the record was changed and
//! `Ok(false)` if its current status did not match. Unknown ids fail with
//! [`StateError::NotFound`](crate::StateError::NotFound).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StateResult;
use crate::types::*;

/// Durable store of submissions and their process chains.
#[async_trait]
pub trait SubmissionRegistry: Send + Sync {
    // ── Submissions ────────────────────────────────────────────────

    /// Insert a new submission. Fails with `Conflict` if the id is taken.
    async fn add_submission(&self, submission: &Submission) -> StateResult<()>;

    async fn find_submission_by_id(&self, id: &str) -> StateResult<Option<Submission>>;

    async fn find_submission_ids_by_status(
        &self,
        status: SubmissionStatus,
    ) -> StateResult<Vec<SubmissionId>>;

    async fn count_submissions(&self) -> StateResult<u64>;

    /// Atomically take the oldest submission in `current` and move it to
    /// `new`.
    async fn fetch_next_submission(
        &self,
        current: SubmissionStatus,
        new: SubmissionStatus,
    ) -> StateResult<Option<Submission>>;

    async fn get_submission_status(&self, id: &str) -> StateResult<SubmissionStatus>;

    async fn set_submission_status(&self, id: &str, status: SubmissionStatus) -> StateResult<()>;

    async fn set_submission_start_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()>;

    async fn set_submission_end_time(&self, id: &str, time: Option<DateTime<Utc>>)
    -> StateResult<()>;

    async fn set_submission_results(
        &self,
        id: &str,
        results: Option<ProcessChainResults>,
    ) -> StateResult<()>;

    async fn set_submission_error_message(
        &self,
        id: &str,
        message: Option<String>,
    ) -> StateResult<()>;

    async fn set_submission_execution_state(
        &self,
        id: &str,
        state: Option<Value>,
    ) -> StateResult<()>;

    // ── Process chains ─────────────────────────────────────────────

    /// Register process chains for an existing submission, in order.
    async fn add_process_chains(
        &self,
        process_chains: &[ProcessChain],
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> StateResult<()>;

    async fn find_process_chain_by_id(&self, id: &str) -> StateResult<Option<ProcessChain>>;

    async fn find_process_chains_by_submission_id(
        &self,
        submission_id: &str,
    ) -> StateResult<Vec<ProcessChain>>;

    async fn find_process_chain_statuses_by_submission_id(
        &self,
        submission_id: &str,
    ) -> StateResult<HashMap<ProcessChainId, ProcessChainStatus>>;

    async fn find_process_chain_ids_by_status(
        &self,
        status: ProcessChainStatus,
    ) -> StateResult<Vec<ProcessChainId>>;

    /// Distinct required-capability sets among chains with `status`.
    async fn find_process_chain_required_capabilities(
        &self,
        status: ProcessChainStatus,
    ) -> StateResult<Vec<CapabilitySet>>;

    /// Count chains with `status`. `None` matches any capability set,
    /// `Some(set)` only chains requiring exactly `set`.
    async fn count_process_chains(
        &self,
        status: ProcessChainStatus,
        required_capabilities: Option<&CapabilitySet>,
    ) -> StateResult<u64>;

    async fn exists_process_chain(
        &self,
        status: ProcessChainStatus,
        required_capabilities: Option<&CapabilitySet>,
    ) -> StateResult<bool>;

    /// Atomically take the oldest chain in `current` (optionally requiring
    /// exactly `required_capabilities`) and move it to `new`. Each chain is
    /// handed to at most one caller.
    async fn fetch_next_process_chain(
        &self,
        current: ProcessChainStatus,
        new: ProcessChainStatus,
        required_capabilities: Option<&CapabilitySet>,
    ) -> StateResult<Option<ProcessChain>>;

    async fn get_process_chain_submission_id(&self, id: &str) -> StateResult<SubmissionId>;

    async fn get_process_chain_status(&self, id: &str) -> StateResult<ProcessChainStatus>;

    /// Set the status of a chain. With `expected` set, only applies if the
    /// current status equals it. Terminal statuses are never left.
    async fn set_process_chain_status(
        &self,
        id: &str,
        status: ProcessChainStatus,
        expected: Option<ProcessChainStatus>,
    ) -> StateResult<bool>;

    /// Move every chain of a submission from `current` to `new`. Returns
    /// the number of chains changed.
    async fn set_all_process_chains_status(
        &self,
        submission_id: &str,
        current: ProcessChainStatus,
        new: ProcessChainStatus,
    ) -> StateResult<u64>;

    async fn get_process_chain_start_time(&self, id: &str)
    -> StateResult<Option<DateTime<Utc>>>;

    async fn set_process_chain_start_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()>;

    async fn get_process_chain_end_time(&self, id: &str) -> StateResult<Option<DateTime<Utc>>>;

    async fn set_process_chain_end_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()>;

    async fn get_process_chain_results(&self, id: &str)
    -> StateResult<Option<ProcessChainResults>>;

    /// No-op once the chain has reached a terminal status.
    async fn set_process_chain_results(
        &self,
        id: &str,
        results: Option<ProcessChainResults>,
    ) -> StateResult<()>;

    async fn get_process_chain_error_message(&self, id: &str) -> StateResult<Option<String>>;

    /// No-op once the chain has reached a terminal status.
    async fn set_process_chain_error_message(
        &self,
        id: &str,
        message: Option<String>,
    ) -> StateResult<()>;
}

/// Durable store of VMs created by the cloud manager.
#[async_trait]
pub trait VmRegistry: Send + Sync {
    /// Insert a new VM. Fails with `Conflict` if the id is taken.
    async fn add_vm(&self, vm: &Vm) -> StateResult<()>;

    async fn find_vms(&self) -> StateResult<Vec<Vm>>;

    async fn find_vm_by_id(&self, id: &str) -> StateResult<Option<Vm>>;

    async fn find_vm_by_agent_id(&self, agent_id: &str) -> StateResult<Option<Vm>>;

    /// VMs that are neither destroyed nor failed.
    async fn find_non_terminated_vms(&self) -> StateResult<Vec<Vm>>;

    async fn count_non_terminated_vms_by_setup(&self, setup_id: &str) -> StateResult<u64>;

    /// VMs of a setup that are being created or provisioned.
    async fn count_starting_vms_by_setup(&self, setup_id: &str) -> StateResult<u64>;

    /// Compare-and-set on the VM status.
    async fn set_vm_status(
        &self,
        id: &str,
        expected: VmStatus,
        status: VmStatus,
    ) -> StateResult<bool>;

    async fn force_set_vm_status(&self, id: &str, status: VmStatus) -> StateResult<()>;

    async fn set_vm_external_id(&self, id: &str, external_id: &str) -> StateResult<()>;

    async fn set_vm_ip_address(&self, id: &str, ip_address: &str) -> StateResult<()>;

    async fn set_vm_agent_id(&self, id: &str, agent_id: &str) -> StateResult<()>;

    async fn set_vm_reason(&self, id: &str, reason: Option<String>) -> StateResult<()>;

    async fn set_vm_creation_time(&self, id: &str, time: Option<DateTime<Utc>>)
    -> StateResult<()>;

    async fn set_vm_destruction_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()>;
}
