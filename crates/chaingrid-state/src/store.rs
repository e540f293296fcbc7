//! StateStore — redb-backed implementation of the ChainGrid registries.
//!
//! Every record is JSON-serialized into redb's `&[u8]` value columns.
//! Compare-and-set and fetch-and-transition operations run inside a single
//! write transaction; redb admits one writer at a time, which makes them
//! atomic with respect to every other task sharing the store. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::registry::{SubmissionRegistry, VmRegistry};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

/// Persisted form of a process chain and its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessChainRecord {
    process_chain: ProcessChain,
    submission_id: SubmissionId,
    status: ProcessChainStatus,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    results: Option<ProcessChainResults>,
    #[serde(default)]
    error_message: Option<String>,
}

impl ProcessChainRecord {
    fn matches(&self, status: ProcessChainStatus, required: Option<&CapabilitySet>) -> bool {
        self.status == status
            && required.is_none_or(|caps| self.process_chain.required_capabilities == *caps)
    }

    /// Apply a status change unless the chain is terminal or the expected
    /// status does not match.
    fn transition(
        &mut self,
        status: ProcessChainStatus,
        expected: Option<ProcessChainStatus>,
    ) -> bool {
        if self.status.is_terminal() || expected.is_some_and(|e| e != self.status) {
            return false;
        }
        self.status = status;
        true
    }
}

/// Thread-safe registry store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SUBMISSIONS).map_err(map_err!(Table))?;
        txn.open_table(SUBMISSION_ORDER).map_err(map_err!(Table))?;
        txn.open_table(PROCESS_CHAINS).map_err(map_err!(Table))?;
        txn.open_table(PROCESS_CHAIN_ORDER).map_err(map_err!(Table))?;
        txn.open_table(VMS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn get_required<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
        kind: &str,
    ) -> StateResult<T> {
        self.get(table, key)?
            .ok_or_else(|| StateError::NotFound(format!("{kind} {key}")))
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List records in insertion order.
    fn list_ordered<T: DeserializeOwned>(
        &self,
        order: OrderTable,
        table: JsonTable,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let order = txn.open_table(order).map_err(map_err!(Table))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in order.iter().map_err(map_err!(Read))? {
            let (_, id) = entry.map_err(map_err!(Read))?;
            if let Some(guard) = table.get(id.value()).map_err(map_err!(Read))? {
                results.push(decode(guard.value())?);
            }
        }
        Ok(results)
    }

    /// Read-modify-write a single record. `f` returns whether it changed
    /// the record; unchanged records are not written back.
    fn update<T, F>(&self, table: JsonTable, key: &str, kind: &str, f: F) -> StateResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let changed = {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let mut record: T = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(format!("{kind} {key}"))),
            };
            let changed = f(&mut record);
            if changed {
                let bytes = encode(&record)?;
                table
                    .insert(key, bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            changed
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(changed)
    }

    /// Atomically find the oldest record satisfying `matches`, apply `f` to
    /// it and write it back.
    fn fetch_next<T, P, F>(
        &self,
        order: OrderTable,
        table: JsonTable,
        matches: P,
        f: F,
    ) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        P: Fn(&T) -> bool,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let fetched = {
            let order = txn.open_table(order).map_err(map_err!(Table))?;
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let mut hit: Option<(String, T)> = None;
            for entry in order.iter().map_err(map_err!(Read))? {
                let (_, id) = entry.map_err(map_err!(Read))?;
                let id = id.value().to_string();
                let Some(guard) = table.get(id.as_str()).map_err(map_err!(Read))? else {
                    continue;
                };
                let record: T = decode(guard.value())?;
                if matches(&record) {
                    hit = Some((id, record));
                    break;
                }
            }
            match hit {
                Some((id, mut record)) => {
                    f(&mut record);
                    let bytes = encode(&record)?;
                    table
                        .insert(id.as_str(), bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(record)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(fetched)
    }

    fn process_chain_records(&self) -> StateResult<Vec<ProcessChainRecord>> {
        self.list_ordered(PROCESS_CHAIN_ORDER, PROCESS_CHAINS)
    }

    fn process_chain_record(&self, id: &str) -> StateResult<ProcessChainRecord> {
        self.get_required(PROCESS_CHAINS, id, "process chain")
    }

    fn update_process_chain<F>(&self, id: &str, f: F) -> StateResult<bool>
    where
        F: FnOnce(&mut ProcessChainRecord) -> bool,
    {
        self.update(PROCESS_CHAINS, id, "process chain", f)
    }

    fn update_submission<F>(&self, id: &str, f: F) -> StateResult<()>
    where
        F: FnOnce(&mut Submission),
    {
        self.update(SUBMISSIONS, id, "submission", |s: &mut Submission| {
            f(s);
            true
        })
        .map(|_| ())
    }

    fn update_vm<F>(&self, id: &str, f: F) -> StateResult<bool>
    where
        F: FnOnce(&mut Vm) -> bool,
    {
        self.update(VMS, id, "vm", f)
    }
}

// ── Submission registry ────────────────────────────────────────────

#[async_trait]
impl SubmissionRegistry for StateStore {
    async fn add_submission(&self, submission: &Submission) -> StateResult<()> {
        let value = encode(submission)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SUBMISSIONS).map_err(map_err!(Table))?;
            if table
                .get(submission.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::Conflict(format!("submission {}", submission.id)));
            }
            table
                .insert(submission.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let mut order = txn.open_table(SUBMISSION_ORDER).map_err(map_err!(Table))?;
            let seq = match order.last().map_err(map_err!(Read))? {
                Some((k, _)) => k.value() + 1,
                None => 0,
            };
            order
                .insert(seq, submission.id.as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(submission_id = %submission.id, "submission stored");
        Ok(())
    }

    async fn find_submission_by_id(&self, id: &str) -> StateResult<Option<Submission>> {
        self.get(SUBMISSIONS, id)
    }

    async fn find_submission_ids_by_status(
        &self,
        status: SubmissionStatus,
    ) -> StateResult<Vec<SubmissionId>> {
        let submissions: Vec<Submission> = self.list_ordered(SUBMISSION_ORDER, SUBMISSIONS)?;
        Ok(submissions
            .into_iter()
            .filter(|s| s.status == status)
            .map(|s| s.id)
            .collect())
    }

    async fn count_submissions(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SUBMISSIONS).map_err(map_err!(Table))?;
        table.len().map_err(map_err!(Read))
    }

    async fn fetch_next_submission(
        &self,
        current: SubmissionStatus,
        new: SubmissionStatus,
    ) -> StateResult<Option<Submission>> {
        self.fetch_next(
            SUBMISSION_ORDER,
            SUBMISSIONS,
            |s: &Submission| s.status == current,
            |s| s.status = new,
        )
    }

    async fn get_submission_status(&self, id: &str) -> StateResult<SubmissionStatus> {
        let submission: Submission = self.get_required(SUBMISSIONS, id, "submission")?;
        Ok(submission.status)
    }

    async fn set_submission_status(&self, id: &str, status: SubmissionStatus) -> StateResult<()> {
        self.update_submission(id, |s| {
            if s.status.is_terminal() {
                debug!(submission_id = %s.id, ?status, "ignoring status change of finished submission");
            } else {
                s.status = status;
            }
        })
    }

    async fn set_submission_start_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()> {
        self.update_submission(id, |s| s.start_time = time)
    }

    async fn set_submission_end_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()> {
        self.update_submission(id, |s| s.end_time = time)
    }

    async fn set_submission_results(
        &self,
        id: &str,
        results: Option<ProcessChainResults>,
    ) -> StateResult<()> {
        self.update_submission(id, |s| s.results = results)
    }

    async fn set_submission_error_message(
        &self,
        id: &str,
        message: Option<String>,
    ) -> StateResult<()> {
        self.update_submission(id, |s| s.error_message = message)
    }

    async fn set_submission_execution_state(
        &self,
        id: &str,
        state: Option<Value>,
    ) -> StateResult<()> {
        self.update_submission(id, |s| s.execution_state = state)
    }

    async fn add_process_chains(
        &self,
        process_chains: &[ProcessChain],
        submission_id: &str,
        status: ProcessChainStatus,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let submissions = txn.open_table(SUBMISSIONS).map_err(map_err!(Table))?;
            if submissions
                .get(submission_id)
                .map_err(map_err!(Read))?
                .is_none()
            {
                return Err(StateError::NotFound(format!("submission {submission_id}")));
            }

            let mut table = txn.open_table(PROCESS_CHAINS).map_err(map_err!(Table))?;
            let mut order = txn.open_table(PROCESS_CHAIN_ORDER).map_err(map_err!(Table))?;
            let mut seq = match order.last().map_err(map_err!(Read))? {
                Some((k, _)) => k.value() + 1,
                None => 0,
            };
            for pc in process_chains {
                if table.get(pc.id.as_str()).map_err(map_err!(Read))?.is_some() {
                    return Err(StateError::Conflict(format!("process chain {}", pc.id)));
                }
                let record = ProcessChainRecord {
                    process_chain: pc.clone(),
                    submission_id: submission_id.to_string(),
                    status,
                    start_time: None,
                    end_time: None,
                    results: None,
                    error_message: None,
                };
                let value = encode(&record)?;
                table
                    .insert(pc.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                order.insert(seq, pc.id.as_str()).map_err(map_err!(Write))?;
                seq += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%submission_id, count = process_chains.len(), "process chains stored");
        Ok(())
    }

    async fn find_process_chain_by_id(&self, id: &str) -> StateResult<Option<ProcessChain>> {
        let record: Option<ProcessChainRecord> = self.get(PROCESS_CHAINS, id)?;
        Ok(record.map(|r| r.process_chain))
    }

    async fn find_process_chains_by_submission_id(
        &self,
        submission_id: &str,
    ) -> StateResult<Vec<ProcessChain>> {
        Ok(self
            .process_chain_records()?
            .into_iter()
            .filter(|r| r.submission_id == submission_id)
            .map(|r| r.process_chain)
            .collect())
    }

    async fn find_process_chain_statuses_by_submission_id(
        &self,
        submission_id: &str,
    ) -> StateResult<HashMap<ProcessChainId, ProcessChainStatus>> {
        let records: Vec<ProcessChainRecord> = self.list(PROCESS_CHAINS)?;
        Ok(records
            .into_iter()
            .filter(|r| r.submission_id == submission_id)
            .map(|r| (r.process_chain.id, r.status))
            .collect())
    }

    async fn find_process_chain_ids_by_status(
        &self,
        status: ProcessChainStatus,
    ) -> StateResult<Vec<ProcessChainId>> {
        Ok(self
            .process_chain_records()?
            .into_iter()
            .filter(|r| r.status == status)
            .map(|r| r.process_chain.id)
            .collect())
    }

    async fn find_process_chain_required_capabilities(
        &self,
        status: ProcessChainStatus,
    ) -> StateResult<Vec<CapabilitySet>> {
        let records: Vec<ProcessChainRecord> = self.list(PROCESS_CHAINS)?;
        let distinct: BTreeSet<CapabilitySet> = records
            .into_iter()
            .filter(|r| r.status == status)
            .map(|r| r.process_chain.required_capabilities)
            .collect();
        Ok(distinct.into_iter().collect())
    }

    async fn count_process_chains(
        &self,
        status: ProcessChainStatus,
        required_capabilities: Option<&CapabilitySet>,
    ) -> StateResult<u64> {
        let records: Vec<ProcessChainRecord> = self.list(PROCESS_CHAINS)?;
        Ok(records
            .iter()
            .filter(|r| r.matches(status, required_capabilities))
            .count() as u64)
    }

    async fn exists_process_chain(
        &self,
        status: ProcessChainStatus,
        required_capabilities: Option<&CapabilitySet>,
    ) -> StateResult<bool> {
        let records: Vec<ProcessChainRecord> = self.list(PROCESS_CHAINS)?;
        Ok(records
            .iter()
            .any(|r| r.matches(status, required_capabilities)))
    }

    async fn fetch_next_process_chain(
        &self,
        current: ProcessChainStatus,
        new: ProcessChainStatus,
        required_capabilities: Option<&CapabilitySet>,
    ) -> StateResult<Option<ProcessChain>> {
        let record = self.fetch_next(
            PROCESS_CHAIN_ORDER,
            PROCESS_CHAINS,
            |r: &ProcessChainRecord| r.matches(current, required_capabilities),
            |r| r.status = new,
        )?;
        if let Some(r) = &record {
            debug!(process_chain_id = %r.process_chain.id, %current, %new, "process chain fetched");
        }
        Ok(record.map(|r| r.process_chain))
    }

    async fn get_process_chain_submission_id(&self, id: &str) -> StateResult<SubmissionId> {
        Ok(self.process_chain_record(id)?.submission_id)
    }

    async fn get_process_chain_status(&self, id: &str) -> StateResult<ProcessChainStatus> {
        Ok(self.process_chain_record(id)?.status)
    }

    async fn set_process_chain_status(
        &self,
        id: &str,
        status: ProcessChainStatus,
        expected: Option<ProcessChainStatus>,
    ) -> StateResult<bool> {
        let applied = self.update_process_chain(id, |r| r.transition(status, expected))?;
        debug!(process_chain_id = %id, %status, ?expected, applied, "process chain status set");
        Ok(applied)
    }

    async fn set_all_process_chains_status(
        &self,
        submission_id: &str,
        current: ProcessChainStatus,
        new: ProcessChainStatus,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = {
            let mut table = txn.open_table(PROCESS_CHAINS).map_err(map_err!(Table))?;
            let mut changed = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let mut record: ProcessChainRecord = decode(value.value())?;
                if record.submission_id == submission_id && record.transition(new, Some(current))
                {
                    changed.push((key.value().to_string(), record));
                }
            }
            for (key, record) in &changed {
                let bytes = encode(record)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            changed.len() as u64
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%submission_id, %current, %new, count, "process chain statuses set");
        Ok(count)
    }

    async fn get_process_chain_start_time(
        &self,
        id: &str,
    ) -> StateResult<Option<DateTime<Utc>>> {
        Ok(self.process_chain_record(id)?.start_time)
    }

    async fn set_process_chain_start_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()> {
        self.update_process_chain(id, |r| {
            r.start_time = time;
            true
        })
        .map(|_| ())
    }

    async fn get_process_chain_end_time(&self, id: &str) -> StateResult<Option<DateTime<Utc>>> {
        Ok(self.process_chain_record(id)?.end_time)
    }

    async fn set_process_chain_end_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()> {
        self.update_process_chain(id, |r| {
            r.end_time = time;
            true
        })
        .map(|_| ())
    }

    async fn get_process_chain_results(
        &self,
        id: &str,
    ) -> StateResult<Option<ProcessChainResults>> {
        Ok(self.process_chain_record(id)?.results)
    }

    async fn set_process_chain_results(
        &self,
        id: &str,
        results: Option<ProcessChainResults>,
    ) -> StateResult<()> {
        let applied = self.update_process_chain(id, |r| {
            if r.status.is_terminal() {
                return false;
            }
            r.results = results;
            true
        })?;
        if !applied {
            debug!(process_chain_id = %id, "process chain is finished, results kept");
        }
        Ok(())
    }

    async fn get_process_chain_error_message(&self, id: &str) -> StateResult<Option<String>> {
        Ok(self.process_chain_record(id)?.error_message)
    }

    async fn set_process_chain_error_message(
        &self,
        id: &str,
        message: Option<String>,
    ) -> StateResult<()> {
        let applied = self.update_process_chain(id, |r| {
            if r.status.is_terminal() {
                return false;
            }
            r.error_message = message;
            true
        })?;
        if !applied {
            debug!(process_chain_id = %id, "process chain is finished, error_message kept");
        }
        Ok(())
    }
}

// ── VM registry ────────────────────────────────────────────────────

#[async_trait]
impl VmRegistry for StateStore {
    async fn add_vm(&self, vm: &Vm) -> StateResult<()> {
        let value = encode(vm)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            if table.get(vm.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("vm {}", vm.id)));
            }
            table
                .insert(vm.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm_id = %vm.id, setup = %vm.setup.id, "vm stored");
        Ok(())
    }

    async fn find_vms(&self) -> StateResult<Vec<Vm>> {
        self.list(VMS)
    }

    async fn find_vm_by_id(&self, id: &str) -> StateResult<Option<Vm>> {
        self.get(VMS, id)
    }

    async fn find_vm_by_agent_id(&self, agent_id: &str) -> StateResult<Option<Vm>> {
        let vms: Vec<Vm> = self.list(VMS)?;
        Ok(vms
            .into_iter()
            .find(|vm| vm.agent_id.as_deref() == Some(agent_id)))
    }

    async fn find_non_terminated_vms(&self) -> StateResult<Vec<Vm>> {
        let vms: Vec<Vm> = self.list(VMS)?;
        Ok(vms
            .into_iter()
            .filter(|vm| !vm.status.is_terminated())
            .collect())
    }

    async fn count_non_terminated_vms_by_setup(&self, setup_id: &str) -> StateResult<u64> {
        let vms: Vec<Vm> = self.list(VMS)?;
        Ok(vms
            .iter()
            .filter(|vm| vm.setup.id == setup_id && !vm.status.is_terminated())
            .count() as u64)
    }

    async fn count_starting_vms_by_setup(&self, setup_id: &str) -> StateResult<u64> {
        let vms: Vec<Vm> = self.list(VMS)?;
        Ok(vms
            .iter()
            .filter(|vm| vm.setup.id == setup_id && vm.status.is_starting())
            .count() as u64)
    }

    async fn set_vm_status(
        &self,
        id: &str,
        expected: VmStatus,
        status: VmStatus,
    ) -> StateResult<bool> {
        let applied = self.update_vm(id, |vm| {
            if vm.status != expected {
                return false;
            }
            vm.status = status;
            true
        })?;
        debug!(vm_id = %id, %expected, %status, applied, "vm status set");
        Ok(applied)
    }

    async fn force_set_vm_status(&self, id: &str, status: VmStatus) -> StateResult<()> {
        self.update_vm(id, |vm| {
            vm.status = status;
            true
        })
        .map(|_| ())
    }

    async fn set_vm_external_id(&self, id: &str, external_id: &str) -> StateResult<()> {
        self.update_vm(id, |vm| {
            vm.external_id = Some(external_id.to_string());
            true
        })
        .map(|_| ())
    }

    async fn set_vm_ip_address(&self, id: &str, ip_address: &str) -> StateResult<()> {
        self.update_vm(id, |vm| {
            vm.ip_address = Some(ip_address.to_string());
            true
        })
        .map(|_| ())
    }

    async fn set_vm_agent_id(&self, id: &str, agent_id: &str) -> StateResult<()> {
        self.update_vm(id, |vm| {
            vm.agent_id = Some(agent_id.to_string());
            true
        })
        .map(|_| ())
    }

    async fn set_vm_reason(&self, id: &str, reason: Option<String>) -> StateResult<()> {
        self.update_vm(id, |vm| {
            vm.reason = reason;
            true
        })
        .map(|_| ())
    }

    async fn set_vm_creation_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()> {
        self.update_vm(id, |vm| {
            vm.creation_time = time;
            true
        })
        .map(|_| ())
    }

    async fn set_vm_destruction_time(
        &self,
        id: &str,
        time: Option<DateTime<Utc>>,
    ) -> StateResult<()> {
        self.update_vm(id, |vm| {
            vm.destruction_time = time;
            true
        })
        .map(|_| ())
    }
}
