//! Cloud manager: creates, provisions and destroys VMs that host remote
//! agents.
//!
//! VMs are created on demand when the scheduler reports a missing agent,
//! and periodically to keep every agent pool and setup at its minimum.
//! Each setup has a gate; checking the setup's capacity and recording the
//! new VM happen while holding it, so concurrent requests cannot push a
//! setup past `max_vms` or `max_create_concurrent`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, LazyLock};

use chaingrid_bus::addresses::{
    REMOTE_AGENT_LEFT, REMOTE_AGENT_MISSING, agent_id_from_address, remote_agent_address,
};
use chaingrid_bus::{AgentMissing, EventBus};
use chaingrid_state::{CapabilitySet, Setup, Vm, VmRegistry, VmStatus};
use chrono::Utc;
use regex::{Captures, Regex};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{CloudClient, resource_metadata};
use crate::config::{CloudConfig, validate_setups};
use crate::error::{CloudError, CloudResult};
use crate::selector::SetupSelector;
use crate::ssh::{SshClient, SshConnector};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("hardcoded regex pattern is valid")
});

/// Replace `{{ name }}` placeholders with values from `vars`. Unknown
/// placeholders are kept.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            vars.iter()
                .find(|(name, _)| *name == &caps[1])
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

struct Inner {
    config: CloudConfig,
    setups: Vec<Setup>,
    client: Arc<dyn CloudClient>,
    ssh: Arc<dyn SshConnector>,
    vms: Arc<dyn VmRegistry>,
    bus: EventBus,
    selector: SetupSelector,
    gates: HashMap<String, Mutex<()>>,
    syncing: Mutex<()>,
}

#[derive(Clone)]
pub struct CloudManager {
    inner: Arc<Inner>,
}

impl CloudManager {
    /// Fails with [`CloudError::Config`] if the setups are inconsistent.
    pub fn new(
        config: CloudConfig,
        setups: Vec<Setup>,
        client: Arc<dyn CloudClient>,
        ssh: Arc<dyn SshConnector>,
        vms: Arc<dyn VmRegistry>,
        bus: EventBus,
    ) -> CloudResult<Self> {
        validate_setups(&setups, &config)?;
        if config.sync_interval_secs == 0 || config.keep_alive_interval_secs == 0 {
            return Err(CloudError::Config(
                "sync and keep-alive intervals must be positive".into(),
            ));
        }
        let selector = SetupSelector::new(vms.clone(), config.agent_pool.clone());
        let gates = setups
            .iter()
            .map(|s| (s.id.clone(), Mutex::new(())))
            .collect();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                setups,
                client,
                ssh,
                vms,
                bus,
                selector,
                gates,
                syncing: Mutex::new(()),
            }),
        })
    }

    pub fn setups(&self) -> &[Setup] {
        &self.inner.setups
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Create one VM whose agent provides `required`. If creating a VM of
    /// the selected setup fails, the next eligible setup is tried; each
    /// setup at most once. Returns `None` if no setup has capacity left.
    pub async fn create_remote_agent(&self, required: &CapabilitySet) -> CloudResult<Option<Vm>> {
        let mut remaining = self.inner.setups.clone();
        loop {
            let selected = self.inner.selector.select(1, required, &remaining).await?;
            let Some(setup) = selected.into_iter().next() else {
                debug!(required = %required, "no setup available");
                return Ok(None);
            };
            remaining.retain(|s| s.id != setup.id);

            match self.create(&setup).await {
                Ok(Some(vm)) => return Ok(Some(vm)),
                Ok(None) => debug!(setup = %setup.id, "setup reached its limits meanwhile"),
                Err(e) => warn!(setup = %setup.id, error = %e, "could not create VM, trying another setup"),
            }
        }
    }

    /// Create and provision one VM of `setup` if it still has capacity.
    async fn create(&self, setup: &Setup) -> CloudResult<Option<Vm>> {
        let Some(vm) = self.reserve(setup).await? else {
            return Ok(None);
        };
        self.provision(vm).await.map(Some)
    }

    /// Record a new VM for `setup` unless that would exceed a limit.
    async fn reserve(&self, setup: &Setup) -> CloudResult<Option<Vm>> {
        let gate = self
            .inner
            .gates
            .get(&setup.id)
            .ok_or_else(|| CloudError::Config(format!("unknown setup `{}`", setup.id)))?;
        let _guard = gate.lock().await;
        if !self.inner.selector.has_capacity(setup).await? {
            return Ok(None);
        }
        let vm = Vm::new(Uuid::new_v4().to_string(), setup.clone());
        self.inner.vms.add_vm(&vm).await?;
        debug!(vm = %vm.id, setup = %setup.id, "VM recorded");
        Ok(Some(vm))
    }

    async fn provision(&self, mut vm: Vm) -> CloudResult<Vm> {
        match self.try_provision(&mut vm).await {
            Ok(()) => {
                info!(vm = %vm.id, setup = %vm.setup.id, ip = ?vm.ip_address, "VM is running");
                Ok(vm)
            }
            Err(e) => {
                error!(vm = %vm.id, setup = %vm.setup.id, error = %e, "VM creation failed");
                if let Some(external_id) = &vm.external_id {
                    if let Err(cleanup) = self.inner.client.destroy_vm(external_id, None).await {
                        warn!(vm = %vm.id, %external_id, error = %cleanup, "could not destroy failed VM");
                    }
                }
                let vms = &self.inner.vms;
                let cleanup = async {
                    if vms.set_vm_status(&vm.id, vm.status, VmStatus::Error).await? {
                        vms.set_vm_reason(&vm.id, Some(e.to_string())).await?;
                        vms.set_vm_destruction_time(&vm.id, Some(Utc::now())).await?;
                    }
                    CloudResult::Ok(())
                };
                if let Err(record) = cleanup.await {
                    warn!(vm = %vm.id, error = %record, "could not record VM failure");
                }
                Err(e)
            }
        }
    }

    async fn try_provision(&self, vm: &mut Vm) -> CloudResult<()> {
        let inner = &self.inner;
        let setup = vm.setup.clone();
        let metadata = resource_metadata(&inner.config.created_by_tag, &setup.id);

        let image_id = inner.client.get_image_id(&setup.image_name).await?;
        let block_device = inner
            .client
            .create_block_device(
                &image_id,
                setup.block_device_size_gb,
                setup.block_device_volume_type.as_deref(),
                &setup.availability_zone,
                &metadata,
            )
            .await?;

        let name = format!("{}-{}", inner.config.created_by_tag, vm.id);
        let external_id = match inner
            .client
            .create_vm(&name, &setup.flavor, &block_device, &setup.availability_zone, &metadata)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = inner.client.destroy_block_device(&block_device).await {
                    warn!(%block_device, error = %cleanup, "could not destroy block device");
                }
                return Err(e);
            }
        };
        inner.vms.set_vm_external_id(&vm.id, &external_id).await?;
        inner.vms.set_vm_creation_time(&vm.id, Some(Utc::now())).await?;
        vm.external_id = Some(external_id.clone());
        self.transition(vm, VmStatus::Provisioning).await?;

        inner.client.wait_for_vm(&external_id, None).await?;
        let ip_address = inner.client.get_ip_address(&external_id).await?;
        inner.vms.set_vm_ip_address(&vm.id, &ip_address).await?;
        vm.ip_address = Some(ip_address.clone());

        let username = inner.config.ssh_username(&setup).ok_or_else(|| {
            CloudError::Config(format!("setup `{}` has no ssh username", setup.id))
        })?;
        let session = self.connect(&ip_address, username).await?;
        for script in &setup.provisioning_scripts {
            self.run_script(session.as_ref(), script, vm, &ip_address)
                .await?;
        }

        // The agent on the VM uses the VM id as its own id.
        inner.vms.set_vm_agent_id(&vm.id, &vm.id).await?;
        vm.agent_id = Some(vm.id.clone());
        self.transition(vm, VmStatus::Running).await
    }

    async fn transition(&self, vm: &mut Vm, status: VmStatus) -> CloudResult<()> {
        if !self.inner.vms.set_vm_status(&vm.id, vm.status, status).await? {
            return Err(CloudError::Provisioning(format!(
                "VM {} left {} while being provisioned",
                vm.id, vm.status
            )));
        }
        vm.status = status;
        Ok(())
    }

    async fn connect(&self, ip_address: &str, username: &str) -> CloudResult<Box<dyn SshClient>> {
        let ssh = &self.inner.config.ssh;
        let attempts = ssh.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.ssh.connect(ip_address, username).await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < attempts => {
                    debug!(%ip_address, attempt, error = %e, "VM not reachable yet");
                    tokio::time::sleep(ssh.connect_backoff()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_script(
        &self,
        session: &dyn SshClient,
        script: &str,
        vm: &Vm,
        ip_address: &str,
    ) -> CloudResult<()> {
        let template = tokio::fs::read_to_string(script).await.map_err(|e| {
            CloudError::Provisioning(format!("could not read provisioning script {script}: {e}"))
        })?;
        let content = render_template(
            &template,
            &[
                ("agentId", vm.id.as_str()),
                ("ipAddress", ip_address),
                ("setupId", vm.setup.id.as_str()),
            ],
        );
        let file_name = Path::new(script)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CloudError::Provisioning(format!("invalid script path {script}")))?;
        let destination = format!("/tmp/{file_name}");

        debug!(vm = %vm.id, %script, %destination, "running provisioning script");
        session.upload(&content, &destination).await?;
        session
            .execute(&format!("sudo chmod +x {destination}"))
            .await?;
        session.execute(&format!("sudo {destination}")).await
    }

    // ── Destruction ────────────────────────────────────────────────

    async fn retire(&self, vm_id: &str, status: VmStatus, reason: &str) -> CloudResult<()> {
        let vms = &self.inner.vms;
        vms.force_set_vm_status(vm_id, status).await?;
        vms.set_vm_reason(vm_id, Some(reason.to_string())).await?;
        vms.set_vm_destruction_time(vm_id, Some(Utc::now())).await?;
        Ok(())
    }

    /// Destroy `vm` at the provider and mark it destroyed. If the provider
    /// refuses, the VM is marked as failed instead.
    pub async fn destroy(&self, vm: &Vm, reason: &str) -> CloudResult<()> {
        if let Some(external_id) = &vm.external_id {
            info!(vm = %vm.id, %external_id, reason, "destroying VM");
            if let Err(e) = self.inner.client.destroy_vm(external_id, None).await {
                self.retire(&vm.id, VmStatus::Error, &format!("could not destroy VM: {e}"))
                    .await?;
                return Err(e);
            }
        }
        self.retire(&vm.id, VmStatus::Destroyed, reason).await
    }

    /// Destroy every VM this node still considers alive.
    pub async fn destroy_all(&self, reason: &str) -> CloudResult<()> {
        for vm in self.inner.vms.find_non_terminated_vms().await? {
            if let Err(e) = self.destroy(&vm, reason).await {
                error!(vm = %vm.id, error = %e, "could not destroy VM");
            }
        }
        Ok(())
    }

    /// Destroy the VM hosting the agent at `address`.
    pub async fn on_agent_left(&self, address: &str) -> CloudResult<()> {
        let Some(agent_id) = agent_id_from_address(address) else {
            return Ok(());
        };
        match self.inner.vms.find_vm_by_agent_id(agent_id).await? {
            Some(vm) if !vm.status.is_terminated() => self.destroy(&vm, "agent left").await,
            _ => Ok(()),
        }
    }

    // ── Reconciliation ─────────────────────────────────────────────

    /// Bring the registry and the provider in line after a restart.
    /// Registry VMs that no longer exist are marked destroyed. VMs that
    /// exist but are not running a provisioned agent, and tagged VMs the
    /// registry does not know, are destroyed.
    pub async fn reconcile(&self) -> CloudResult<()> {
        let inner = &self.inner;
        let at_provider: HashSet<String> = inner
            .client
            .list_vms(&inner.config.created_by_tag)
            .await?
            .into_iter()
            .collect();

        let mut known = HashSet::new();
        for vm in inner.vms.find_non_terminated_vms().await? {
            let Some(external_id) = vm.external_id.clone() else {
                info!(vm = %vm.id, "VM was never created, marking it destroyed");
                self.retire(&vm.id, VmStatus::Destroyed, "VM was never created")
                    .await?;
                continue;
            };
            known.insert(external_id.clone());

            if !at_provider.contains(&external_id) {
                info!(vm = %vm.id, %external_id, "VM does not exist anymore, marking it destroyed");
                self.retire(&vm.id, VmStatus::Destroyed, "VM does not exist at the provider")
                    .await?;
            } else if !inner.client.is_vm_active(&external_id).await? {
                self.destroy(&vm, "VM is not active").await?;
            } else if vm.status != VmStatus::Running {
                self.destroy(&vm, "provisioning was interrupted").await?;
            }
        }

        for external_id in at_provider.difference(&known) {
            info!(%external_id, "destroying VM unknown to the registry");
            if let Err(e) = inner.client.destroy_vm(external_id, None).await {
                warn!(%external_id, error = %e, "could not destroy unknown VM");
            }
        }
        Ok(())
    }

    /// Retire running VMs that are gone at the provider and create VMs
    /// until every pool and setup is at its minimum. Returns the number of
    /// VMs created. Does nothing if another sync is still running.
    pub async fn sync(&self) -> CloudResult<usize> {
        let Ok(_guard) = self.inner.syncing.try_lock() else {
            debug!("previous sync still running");
            return Ok(0);
        };

        for vm in self.inner.vms.find_non_terminated_vms().await? {
            let Some(external_id) = vm.external_id.as_deref() else {
                continue;
            };
            if vm.status == VmStatus::Running && !self.inner.client.is_vm_active(external_id).await? {
                if let Err(e) = self.destroy(&vm, "VM is not active anymore").await {
                    warn!(vm = %vm.id, error = %e, "could not retire inactive VM");
                }
            }
        }

        let missing = self
            .inner
            .selector
            .select_minimum(&self.inner.setups, true)
            .await?;
        if missing.is_empty() {
            return Ok(0);
        }
        info!(count = missing.len(), "creating VMs to reach minimum capacity");

        let mut tasks = JoinSet::new();
        for setup in missing {
            let manager = self.clone();
            tasks.spawn(async move { manager.create(&setup).await });
        }
        let mut created = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(_))) => created += 1,
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(error = %e, "could not create VM for minimum capacity"),
                Err(e) => error!(error = %e, "VM creation task failed"),
            }
        }
        Ok(created)
    }

    /// Ping the agents of running VMs that make up the minimum capacity so
    /// they do not shut themselves down. Returns the number of pings sent.
    pub async fn send_keep_alive(&self) -> CloudResult<usize> {
        let minimum = self
            .inner
            .selector
            .select_minimum(&self.inner.setups, false)
            .await?;
        let mut running: Vec<Vm> = self
            .inner
            .vms
            .find_non_terminated_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.status == VmStatus::Running && vm.agent_id.is_some())
            .collect();

        let mut sent = 0;
        for setup in &minimum {
            let Some(pos) = running.iter().position(|vm| vm.setup.id == setup.id) else {
                continue;
            };
            let vm = running.remove(pos);
            let Some(agent_id) = vm.agent_id.as_deref() else {
                continue;
            };
            let address = remote_agent_address(agent_id);
            match self
                .inner
                .bus
                .send(&address, json!({ "action": "keepAlive" }))
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => debug!(%address, error = %e, "keep-alive not delivered"),
            }
        }
        Ok(sent)
    }

    // ── Event loop ─────────────────────────────────────────────────

    fn on_agent_missing(&self, body: Value, tasks: &mut JoinSet<()>) {
        let missing: AgentMissing = match serde_json::from_value(body) {
            Ok(missing) => missing,
            Err(e) => {
                warn!(error = %e, "ignoring malformed agent-missing message");
                return;
            }
        };
        let manager = self.clone();
        tasks.spawn(async move {
            if let Err(e) = manager
                .create_remote_agent(&missing.required_capabilities)
                .await
            {
                error!(required = %missing.required_capabilities, error = %e, "could not create remote agent");
            }
        });
    }

    /// Reconcile, then serve demand signals and run the periodic sync and
    /// keep-alive until `shutdown` changes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> CloudResult<()> {
        let bus = self.inner.bus.clone();
        let mut missing = bus.subscribe(REMOTE_AGENT_MISSING).await;
        let mut left = bus.subscribe(REMOTE_AGENT_LEFT).await;

        if let Err(e) = self.reconcile().await {
            error!(error = %e, "could not reconcile VMs with the provider");
        }
        info!(setups = self.inner.setups.len(), "cloud manager started");

        let config = &self.inner.config;
        let mut sync_timer = tokio::time::interval(config.sync_interval());
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keep_alive_timer = tokio::time::interval(config.keep_alive_interval());
        keep_alive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = sync_timer.tick() => {
                    let manager = self.clone();
                    tasks.spawn(async move {
                        if let Err(e) = manager.sync().await {
                            error!(error = %e, "sync failed");
                        }
                    });
                }
                _ = keep_alive_timer.tick() => match self.send_keep_alive().await {
                    Ok(sent) => debug!(sent, "keep-alive sent"),
                    Err(e) => warn!(error = %e, "could not send keep-alive"),
                },
                msg = missing.recv() => match msg {
                    Some(body) => self.on_agent_missing(body, &mut tasks),
                    None => break,
                },
                msg = left.recv() => match msg {
                    Some(Value::String(address)) => {
                        let manager = self.clone();
                        tasks.spawn(async move {
                            if let Err(e) = manager.on_agent_left(&address).await {
                                error!(%address, error = %e, "could not destroy VM of departed agent");
                            }
                        });
                    }
                    Some(other) => warn!(body = %other, "ignoring malformed agent-left message"),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "cloud manager task failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("cloud manager shutting down");
                    break;
                }
            }
        }

        tasks.shutdown().await;
        if self.inner.config.destroy_on_shutdown {
            self.destroy_all("shutting down").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Metadata;
    use async_trait::async_trait;
    use chaingrid_bus::AgentRequest;
    use chaingrid_state::{PoolAgentParams, StateStore};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    // ── Mock provider ──────────────────────────────────────────────

    #[derive(Default)]
    struct Provider {
        next_id: u64,
        images: Vec<String>,
        block_devices: Vec<(String, u32, Option<String>, Metadata)>,
        destroyed_block_devices: Vec<String>,
        /// (external id, flavor, metadata)
        vms: Vec<(String, String, Metadata)>,
        active: HashSet<String>,
        destroyed_vms: Vec<String>,
        failing_flavors: HashSet<String>,
    }

    #[derive(Default)]
    struct MockCloud {
        state: StdMutex<Provider>,
    }

    impl MockCloud {
        fn with<R>(&self, f: impl FnOnce(&mut Provider) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }

        fn created_flavors(&self) -> Vec<String> {
            self.with(|p| p.vms.iter().map(|(_, flavor, _)| flavor.clone()).collect())
        }

        /// A tagged VM that exists at the provider.
        fn add_vm(&self, external_id: &str, tag: &str, active: bool) {
            self.with(|p| {
                p.vms.push((
                    external_id.to_string(),
                    "m1".to_string(),
                    resource_metadata(tag, "small"),
                ));
                if active {
                    p.active.insert(external_id.to_string());
                }
            });
        }
    }

    #[async_trait]
    impl CloudClient for MockCloud {
        async fn list_vms(&self, created_by: &str) -> CloudResult<Vec<String>> {
            Ok(self.with(|p| {
                p.vms
                    .iter()
                    .filter(|(id, _, m)| {
                        !p.destroyed_vms.contains(id)
                            && m.get("Created-By").map(String::as_str) == Some(created_by)
                    })
                    .map(|(id, _, _)| id.clone())
                    .collect()
            }))
        }

        async fn get_image_id(&self, image_name: &str) -> CloudResult<String> {
            self.with(|p| p.images.push(image_name.to_string()));
            Ok(format!("img-{image_name}"))
        }

        async fn create_block_device(
            &self,
            image_id: &str,
            size_gb: u32,
            volume_type: Option<&str>,
            _availability_zone: &str,
            metadata: &Metadata,
        ) -> CloudResult<String> {
            tokio::task::yield_now().await;
            Ok(self.with(|p| {
                p.next_id += 1;
                let id = format!("bd-{}", p.next_id);
                p.block_devices.push((
                    image_id.to_string(),
                    size_gb,
                    volume_type.map(str::to_string),
                    metadata.clone(),
                ));
                id
            }))
        }

        async fn destroy_block_device(&self, id: &str) -> CloudResult<()> {
            self.with(|p| p.destroyed_block_devices.push(id.to_string()));
            Ok(())
        }

        async fn create_vm(
            &self,
            _name: &str,
            flavor: &str,
            _block_device_id: &str,
            _availability_zone: &str,
            metadata: &Metadata,
        ) -> CloudResult<String> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.with(|p| {
                if p.failing_flavors.contains(flavor) {
                    return Err(CloudError::Provider(format!("no capacity for {flavor}")));
                }
                p.next_id += 1;
                let id = format!("ext-{}", p.next_id);
                p.vms.push((id.clone(), flavor.to_string(), metadata.clone()));
                p.active.insert(id.clone());
                Ok(id)
            })
        }

        async fn is_vm_active(&self, id: &str) -> CloudResult<bool> {
            Ok(self.with(|p| p.active.contains(id)))
        }

        async fn wait_for_vm(&self, _id: &str, _timeout: Option<Duration>) -> CloudResult<()> {
            tokio::task::yield_now().await;
            Ok(())
        }

        async fn get_ip_address(&self, id: &str) -> CloudResult<String> {
            Ok(format!("10.0.0.{}", id.trim_start_matches("ext-")))
        }

        async fn destroy_vm(&self, id: &str, _timeout: Option<Duration>) -> CloudResult<()> {
            self.with(|p| {
                p.active.remove(id);
                p.destroyed_vms.push(id.to_string());
            });
            Ok(())
        }
    }

    // ── Mock SSH ───────────────────────────────────────────────────

    #[derive(Default)]
    struct SshLog {
        connects: Vec<(String, String)>,
        uploads: Vec<(String, String)>,
        commands: Vec<String>,
    }

    #[derive(Default)]
    struct MockSsh {
        log: Arc<StdMutex<SshLog>>,
        refuse_connects: AtomicU32,
        fail_commands: bool,
    }

    struct MockSession {
        log: Arc<StdMutex<SshLog>>,
        fail_commands: bool,
    }

    #[async_trait]
    impl SshConnector for MockSsh {
        async fn connect(&self, ip_address: &str, username: &str) -> CloudResult<Box<dyn SshClient>> {
            let refusing = self.refuse_connects.load(Ordering::SeqCst);
            if refusing > 0 {
                self.refuse_connects.store(refusing - 1, Ordering::SeqCst);
                return Err(CloudError::Ssh("connection refused".into()));
            }
            self.log
                .lock()
                .unwrap()
                .connects
                .push((ip_address.to_string(), username.to_string()));
            Ok(Box::new(MockSession {
                log: self.log.clone(),
                fail_commands: self.fail_commands,
            }))
        }
    }

    #[async_trait]
    impl SshClient for MockSession {
        async fn upload(&self, content: &str, remote_path: &str) -> CloudResult<()> {
            self.log
                .lock()
                .unwrap()
                .uploads
                .push((remote_path.to_string(), content.to_string()));
            Ok(())
        }

        async fn execute(&self, command: &str) -> CloudResult<()> {
            self.log.lock().unwrap().commands.push(command.to_string());
            if self.fail_commands {
                return Err(CloudError::Ssh(format!("`{command}` exited with 1")));
            }
            Ok(())
        }
    }

    // ── Fixture ────────────────────────────────────────────────────

    const TAG: &str = "chaingrid-test";

    struct Fixture {
        manager: CloudManager,
        cloud: Arc<MockCloud>,
        ssh: Arc<MockSsh>,
        store: StateStore,
        bus: EventBus,
        _dir: TempDir,
    }

    fn config(pools: Vec<PoolAgentParams>) -> CloudConfig {
        let mut config = CloudConfig {
            created_by_tag: TAG.to_string(),
            agent_pool: pools,
            ..CloudConfig::default()
        };
        config.ssh.username = Some("user".into());
        config.ssh.connect_attempts = 3;
        config.ssh.connect_backoff_secs = 0;
        config
    }

    fn setup(id: &str, flavor: &str, max_vms: u32, mcc: Option<u32>, provided: &[&str]) -> Setup {
        Setup {
            id: id.to_string(),
            flavor: flavor.to_string(),
            image_name: format!("{id}-image"),
            availability_zone: "az-01".to_string(),
            block_device_size_gb: 20,
            block_device_volume_type: None,
            min_vms: 0,
            max_vms,
            max_create_concurrent: mcc,
            provisioning_scripts: Vec::new(),
            provided_capabilities: provided.iter().copied().collect(),
            ssh_username: None,
        }
    }

    fn fixture_with(setups: Vec<Setup>, pools: Vec<PoolAgentParams>, ssh: MockSsh) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("provision.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho {{ agentId }} {{ipAddress}} {{  setupId }} {{ other }}\n",
        )
        .unwrap();
        let setups = setups
            .into_iter()
            .map(|mut s| {
                s.provisioning_scripts = vec![script.display().to_string()];
                s
            })
            .collect();

        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let cloud = Arc::new(MockCloud::default());
        let ssh = Arc::new(ssh);
        let manager = CloudManager::new(
            config(pools),
            setups,
            cloud.clone(),
            ssh.clone(),
            Arc::new(store.clone()),
            bus.clone(),
        )
        .unwrap();
        Fixture {
            manager,
            cloud,
            ssh,
            store,
            bus,
            _dir: dir,
        }
    }

    fn fixture(setups: Vec<Setup>) -> Fixture {
        fixture_with(setups, Vec::new(), MockSsh::default())
    }

    fn foo() -> CapabilitySet {
        ["foo"].into_iter().collect()
    }

    async fn vms_with_status(store: &StateStore, status: VmStatus) -> Vec<Vm> {
        store
            .find_vms()
            .await
            .unwrap()
            .into_iter()
            .filter(|vm| vm.status == status)
            .collect()
    }

    // ── Tests ──────────────────────────────────────────────────────

    #[test]
    fn templates_render_known_placeholders() {
        let rendered = render_template(
            "id={{ agentId }} ip={{ipAddress}} other={{ nope }}",
            &[("agentId", "vm-1"), ("ipAddress", "10.0.0.1")],
        );
        assert_eq!(rendered, "id=vm-1 ip=10.0.0.1 other={{ nope }}");
    }

    #[tokio::test]
    async fn on_demand_creation_provisions_vm() {
        let f = fixture(vec![setup("small", "m1", 1, None, &["foo"])]);
        let vm = f.manager.create_remote_agent(&foo()).await.unwrap().unwrap();

        let stored = f.store.find_vm_by_id(&vm.id).await.unwrap().unwrap();
        assert_eq!(stored.status, VmStatus::Running);
        assert_eq!(stored.agent_id.as_deref(), Some(vm.id.as_str()));
        let external_id = stored.external_id.clone().unwrap();
        assert_eq!(stored.ip_address, Some(format!("10.0.0.{}", external_id.trim_start_matches("ext-"))));
        assert!(stored.creation_time.is_some());

        f.cloud.with(|p| {
            assert_eq!(p.images, ["small-image"]);
            assert_eq!(p.block_devices.len(), 1);
            let (image, size, volume_type, metadata) = &p.block_devices[0];
            assert_eq!(image, "img-small-image");
            assert_eq!(*size, 20);
            assert_eq!(*volume_type, None);
            assert_eq!(metadata, &resource_metadata(TAG, "small"));
            assert_eq!(p.vms[0].2, resource_metadata(TAG, "small"));
        });

        let log = f.ssh.log.lock().unwrap();
        assert_eq!(log.connects[0].1, "user");
        assert_eq!(log.uploads.len(), 1);
        let (destination, content) = &log.uploads[0];
        assert_eq!(destination, "/tmp/provision.sh");
        assert_eq!(
            content,
            &format!(
                "#!/bin/sh\necho {} {} small {{{{ other }}}}\n",
                vm.id,
                stored.ip_address.as_deref().unwrap()
            )
        );
        assert_eq!(
            log.commands,
            ["sudo chmod +x /tmp/provision.sh", "sudo /tmp/provision.sh"]
        );
    }

    #[tokio::test]
    async fn concurrent_requests_respect_max_vms() {
        let f = fixture(vec![setup("small", "m1", 1, None, &["foo"])]);
        let caps = foo();
        let (a, b) = tokio::join!(
            f.manager.create_remote_agent(&caps),
            f.manager.create_remote_agent(&caps)
        );
        let created = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
        assert_eq!(created, 1);
        assert_eq!(f.cloud.created_flavors().len(), 1);
        assert_eq!(f.ssh.log.lock().unwrap().connects.len(), 1);
        assert_eq!(f.store.find_vms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sequential_requests_stop_at_max_vms() {
        let f = fixture(vec![setup("large", "m4", 4, None, &["foo"])]);
        for _ in 0..5 {
            f.manager.create_remote_agent(&foo()).await.unwrap();
        }
        assert_eq!(f.cloud.created_flavors().len(), 4);
        assert_eq!(vms_with_status(&f.store, VmStatus::Running).await.len(), 4);
    }

    #[tokio::test]
    async fn create_concurrency_is_limited_per_setup() {
        let f = fixture(vec![setup("two", "m2", 3, Some(2), &["foo"])]);
        let two = f.manager.setups()[0].clone();
        let (a, b, c) = tokio::join!(
            f.manager.create(&two),
            f.manager.create(&two),
            f.manager.create(&two)
        );
        let created = [a.unwrap(), b.unwrap(), c.unwrap()]
            .into_iter()
            .flatten()
            .count();
        assert_eq!(created, 2);

        // Once running, the third VM fits.
        assert!(f.manager.create(&two).await.unwrap().is_some());
        assert!(f.manager.create(&two).await.unwrap().is_none());
        assert_eq!(f.cloud.created_flavors().len(), 3);
    }

    #[tokio::test]
    async fn failed_creation_falls_back_to_alternative_setup() {
        let f = fixture(vec![
            setup("first", "broken", 1, None, &["foo"]),
            setup("second", "m1", 1, None, &["foo", "bar"]),
        ]);
        f.cloud.with(|p| p.failing_flavors.insert("broken".into()));

        let vm = f.manager.create_remote_agent(&foo()).await.unwrap().unwrap();
        assert_eq!(vm.setup.id, "second");

        f.cloud.with(|p| {
            assert_eq!(p.images, ["first-image", "second-image"]);
            assert_eq!(p.block_devices.len(), 2);
            assert_eq!(p.destroyed_block_devices.len(), 1);
        });
        assert_eq!(f.cloud.created_flavors(), ["m1"]);

        let failed = vms_with_status(&f.store, VmStatus::Error).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].setup.id, "first");
        assert!(failed[0].reason.as_deref().unwrap().contains("no capacity"));
    }

    #[tokio::test]
    async fn every_setup_is_tried_once() {
        let f = fixture(vec![
            setup("first", "broken", 5, None, &["foo"]),
            setup("second", "broken", 5, None, &["foo"]),
        ]);
        f.cloud.with(|p| p.failing_flavors.insert("broken".into()));

        assert!(f.manager.create_remote_agent(&foo()).await.unwrap().is_none());
        f.cloud.with(|p| {
            assert_eq!(p.block_devices.len(), 2);
            assert_eq!(p.destroyed_block_devices.len(), 2);
        });
        assert_eq!(vms_with_status(&f.store, VmStatus::Error).await.len(), 2);
    }

    #[tokio::test]
    async fn provisioning_failure_destroys_vm() {
        let ssh = MockSsh {
            fail_commands: true,
            ..MockSsh::default()
        };
        let f = fixture_with(vec![setup("small", "m1", 1, None, &["foo"])], Vec::new(), ssh);

        assert!(f.manager.create_remote_agent(&foo()).await.unwrap().is_none());
        let failed = vms_with_status(&f.store, VmStatus::Error).await;
        assert_eq!(failed.len(), 1);
        let external_id = failed[0].external_id.clone().unwrap();
        f.cloud.with(|p| assert_eq!(p.destroyed_vms, [external_id]));
    }

    #[tokio::test]
    async fn ssh_connect_is_retried() {
        let ssh = MockSsh {
            refuse_connects: AtomicU32::new(2),
            ..MockSsh::default()
        };
        let f = fixture_with(vec![setup("small", "m1", 1, None, &["foo"])], Vec::new(), ssh);
        let vm = f.manager.create_remote_agent(&foo()).await.unwrap();
        assert!(vm.is_some());
        assert_eq!(f.ssh.log.lock().unwrap().connects.len(), 1);
    }

    #[tokio::test]
    async fn ssh_connect_gives_up() {
        let ssh = MockSsh {
            refuse_connects: AtomicU32::new(3),
            ..MockSsh::default()
        };
        let f = fixture_with(vec![setup("small", "m1", 1, None, &["foo"])], Vec::new(), ssh);
        assert!(f.manager.create_remote_agent(&foo()).await.unwrap().is_none());
        assert_eq!(vms_with_status(&f.store, VmStatus::Error).await.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_with_provider() {
        let f = fixture(vec![setup("small", "m1", 5, None, &["foo"])]);
        let small = f.manager.setups()[0].clone();

        let record = |id: &str, status: VmStatus, external_id: Option<&str>| {
            let mut vm = Vm::new(id, small.clone());
            vm.status = status;
            vm.external_id = external_id.map(str::to_string);
            vm
        };
        for vm in [
            record("alive", VmStatus::Running, Some("ext-alive")),
            record("gone", VmStatus::Running, Some("ext-gone")),
            record("never", VmStatus::Creating, None),
            record("stuck", VmStatus::Provisioning, Some("ext-stuck")),
            record("inactive", VmStatus::Running, Some("ext-inactive")),
        ] {
            f.store.add_vm(&vm).await.unwrap();
        }
        f.cloud.add_vm("ext-alive", TAG, true);
        f.cloud.add_vm("ext-stuck", TAG, true);
        f.cloud.add_vm("ext-inactive", TAG, false);
        f.cloud.add_vm("ext-stray", TAG, true);
        f.cloud.add_vm("ext-foreign", "someone-else", true);

        f.manager.reconcile().await.unwrap();

        let status = |id: &'static str| {
            let store = f.store.clone();
            async move { store.find_vm_by_id(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status("alive").await, VmStatus::Running);
        assert_eq!(status("gone").await, VmStatus::Destroyed);
        assert_eq!(status("never").await, VmStatus::Destroyed);
        assert_eq!(status("stuck").await, VmStatus::Destroyed);
        assert_eq!(status("inactive").await, VmStatus::Destroyed);

        f.cloud.with(|p| {
            let mut destroyed = p.destroyed_vms.clone();
            destroyed.sort();
            assert_eq!(destroyed, ["ext-inactive", "ext-stray", "ext-stuck"]);
        });
    }

    #[tokio::test]
    async fn sync_creates_minimum_capacity_once() {
        let pools = vec![PoolAgentParams {
            capabilities: foo(),
            min: 2,
            max: None,
        }];
        let f = fixture_with(
            vec![setup("small", "m1", 5, None, &["foo"])],
            pools,
            MockSsh::default(),
        );
        assert_eq!(f.manager.sync().await.unwrap(), 2);
        assert_eq!(f.manager.sync().await.unwrap(), 0);
        assert_eq!(vms_with_status(&f.store, VmStatus::Running).await.len(), 2);
    }

    #[tokio::test]
    async fn sync_replaces_vanished_vms() {
        let mut small = setup("small", "m1", 5, None, &["foo"]);
        small.min_vms = 1;
        let f = fixture(vec![small]);
        assert_eq!(f.manager.sync().await.unwrap(), 1);

        let vm = vms_with_status(&f.store, VmStatus::Running).await.remove(0);
        let external_id = vm.external_id.clone().unwrap();
        f.cloud.with(|p| p.active.remove(&external_id));

        assert_eq!(f.manager.sync().await.unwrap(), 1);
        let old = f.store.find_vm_by_id(&vm.id).await.unwrap().unwrap();
        assert_eq!(old.status, VmStatus::Destroyed);
        assert_eq!(vms_with_status(&f.store, VmStatus::Running).await.len(), 1);
    }

    #[tokio::test]
    async fn keep_alive_reaches_minimum_agents_only() {
        let mut small = setup("small", "m1", 5, None, &["foo"]);
        small.min_vms = 1;
        let f = fixture(vec![small]);
        f.manager.sync().await.unwrap();
        f.manager.create_remote_agent(&foo()).await.unwrap().unwrap();

        let running = vms_with_status(&f.store, VmStatus::Running).await;
        assert_eq!(running.len(), 2);
        let mut handlers = Vec::new();
        for vm in &running {
            let address = remote_agent_address(vm.agent_id.as_deref().unwrap());
            handlers.push(f.bus.register(&address).await);
        }

        assert_eq!(f.manager.send_keep_alive().await.unwrap(), 1);
        let mut pinged = 0;
        for mut handler in handlers {
            if let Ok(Some(envelope)) =
                tokio::time::timeout(Duration::from_millis(50), handler.recv()).await
            {
                assert_eq!(envelope.parse::<AgentRequest>().unwrap(), AgentRequest::KeepAlive);
                pinged += 1;
            }
        }
        assert_eq!(pinged, 1, "surplus agents are not kept alive");
    }

    #[tokio::test]
    async fn departed_agent_vm_is_destroyed() {
        let f = fixture(vec![setup("small", "m1", 1, None, &["foo"])]);
        let vm = f.manager.create_remote_agent(&foo()).await.unwrap().unwrap();

        f.manager
            .on_agent_left(&remote_agent_address(&vm.id))
            .await
            .unwrap();
        let stored = f.store.find_vm_by_id(&vm.id).await.unwrap().unwrap();
        assert_eq!(stored.status, VmStatus::Destroyed);
        assert_eq!(stored.reason.as_deref(), Some("agent left"));
        assert!(stored.destruction_time.is_some());

        // capacity is free again
        assert!(f.manager.create_remote_agent(&foo()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_serves_demand_and_cleans_up() {
        let f = fixture(vec![setup("small", "m1", 1, None, &["foo"])]);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.manager.clone().run(rx));

        let missing = AgentMissing {
            n: 1,
            required_capabilities: foo(),
        };
        let running = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                f.bus.publish_as(REMOTE_AGENT_MISSING, &missing).await.unwrap();
                let running = vms_with_status(&f.store, VmStatus::Running).await;
                if !running.is_empty() {
                    return running;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(running.len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        let vm = f.store.find_vm_by_id(&running[0].id).await.unwrap().unwrap();
        assert_eq!(vm.status, VmStatus::Destroyed);
        assert_eq!(f.store.find_vms().await.unwrap().len(), 1);
    }

    #[test]
    fn invalid_setups_are_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let small = setup("small", "m1", 1, None, &["foo"]);
        let result = CloudManager::new(
            config(Vec::new()),
            vec![small.clone(), small],
            Arc::new(MockCloud::default()),
            Arc::new(MockSsh::default()),
            Arc::new(store),
            EventBus::new(),
        );
        assert!(matches!(result, Err(CloudError::Config(_))));
    }
}
