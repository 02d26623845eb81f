pub mod container;
pub mod hypervisor;
pub mod machine;
pub mod stats;
pub mod sysprep;
pub mod watchdog;

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use papaya::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    agent::{
        disk::DiskAgent,
        error::{AgentError, Result},
        image::{ImageAgent, validate_name},
        machine::{
            container::runtime::ContainerRuntime,
            hypervisor::monitor::ControlChannel,
            machine::{
                BackendKind, Backup, Machine, MachineDescriptor, MachineSpec, MachineState,
                MachineStats, MachineUpdate, NetworkInterface, RuntimeHandle,
            },
            watchdog::{Notifier, Watchdog, WatchdogConfig, WatchdogTarget},
        },
        net::{NetAgent, stats::PacketCounters},
        storage::{StorageBackend, machine_dir},
    },
    constants::ARCHIVE_EXTENSION,
    machinery::store::Store,
};

#[derive(Debug, Clone)]
pub struct MachineAgentConfig {
    pub base_path: String,
    /// Where migrated disks and archives are received.
    pub migration_path: String,
    pub hypervisor_binary: String,
    pub enable_kvm: bool,
    /// How long a freshly spawned hypervisor must survive before start reports success.
    pub start_grace: Duration,
    pub storage: StorageBackend,
    /// Hashes root passwords for sysprep; takes `openssl passwd` arguments.
    pub password_tool: String,
    /// `None` disables traffic monitoring.
    pub watchdog: Option<WatchdogConfig>,
}

/// Everything a backend needs to act on one machine.
pub struct MachineContext {
    pub config: MachineAgentConfig,
    pub net: Arc<NetAgent>,
    pub disk: Arc<DiskAgent>,
    pub control: Arc<dyn ControlChannel>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl MachineContext {
    pub fn machine_dir(&self, kind: BackendKind, name: &str) -> PathBuf {
        machine_dir(Path::new(&self.config.base_path), kind.dir_name(), name)
    }

    /// Where a migration source ships the content of machine `name`.
    pub fn migration_payload(&self, kind: BackendKind, name: &str) -> PathBuf {
        Path::new(&self.config.migration_path).join(migration_file(kind, name))
    }
}

/// Name of the file carrying a migrated machine's content: the disk of a hypervisor machine, a
/// directory archive for a container.
pub fn migration_file(kind: BackendKind, name: &str) -> String {
    match kind {
        BackendKind::Hypervisor => format!("{name}.qcow2"),
        BackendKind::Container => format!("{name}.{ARCHIVE_EXTENSION}"),
    }
}

/// Host bindings only the machine agent uses.
pub struct MachineBindings {
    pub control: Arc<dyn ControlChannel>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub counters: Arc<dyn PacketCounters>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct MachineAgent {
    ctx: MachineContext,
    store: Arc<Store>,
    image: Arc<ImageAgent>,
    counters: Arc<dyn PacketCounters>,
    notifier: Arc<dyn Notifier>,
    watchdogs: HashMap<String, CancellationToken>,
    this: Weak<MachineAgent>,
}

impl MachineAgent {
    pub async fn new(
        config: MachineAgentConfig,
        store: Arc<Store>,
        image: Arc<ImageAgent>,
        net: Arc<NetAgent>,
        disk: Arc<DiskAgent>,
        bindings: MachineBindings,
    ) -> anyhow::Result<Arc<Self>> {
        let base_path = PathBuf::from(&config.base_path);
        for kind in [BackendKind::Hypervisor, BackendKind::Container] {
            tokio::fs::create_dir_all(base_path.join(kind.dir_name())).await?;
        }
        tokio::fs::create_dir_all(&config.migration_path).await?;

        let ctx = MachineContext {
            config,
            net,
            disk,
            control: bindings.control,
            runtime: bindings.runtime,
        };

        Ok(Arc::new_cyclic(|this| Self {
            ctx,
            store,
            image,
            counters: bindings.counters,
            notifier: bindings.notifier,
            watchdogs: HashMap::new(),
            this: this.clone(),
        }))
    }

    pub fn context(&self) -> &MachineContext {
        &self.ctx
    }

    fn persist(&self, descriptor: &MachineDescriptor) -> Result<()> {
        self.store.put(descriptor).map_err(AgentError::Store)
    }

    /// Persists what the backend left in the descriptor, whether or not the operation succeeded.
    fn settle<T>(&self, descriptor: &MachineDescriptor, result: Result<T>) -> Result<T> {
        let persisted = self.persist(descriptor);
        let value = result?;
        persisted?;
        Ok(value)
    }

    pub fn machine(&self, name: &str) -> Result<Option<MachineDescriptor>> {
        self.store.get(name).map_err(AgentError::Store)
    }

    pub fn machine_info(&self, name: &str) -> Result<MachineDescriptor> {
        self.machine(name)?
            .ok_or_else(|| AgentError::not_found("machine", name))
    }

    pub fn machine_list(&self) -> Result<Vec<MachineDescriptor>> {
        self.store.list().map_err(AgentError::Store)
    }

    fn ensure_free(&self, name: &str) -> Result<()> {
        validate_name("machine name", name)?;
        if self.machine(name)?.is_some() {
            return Err(AgentError::AlreadyExists {
                kind: "machine",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Smallest index no stored machine holds.
    fn next_index(&self) -> Result<u32> {
        let taken: HashSet<u32> = self.machine_list()?.iter().map(|m| m.index).collect();
        Ok((0..).find(|index| !taken.contains(index)).unwrap_or_default())
    }

    async fn release_interfaces(&self, interfaces: &[NetworkInterface]) {
        for iface in interfaces {
            self.ctx.net.release(iface).await;
        }
    }

    /// Grants every interface in order. When one fails, only the ones granted before it are
    /// handed back; the failing MAC may belong to another machine.
    async fn provision_interfaces(&self, interfaces: &mut [NetworkInterface]) -> Result<()> {
        for ordinal in 0..interfaces.len() {
            if let Err(e) = self.ctx.net.provision(&mut interfaces[ordinal]).await {
                self.release_interfaces(&interfaces[..ordinal]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn machine_create(&self, spec: MachineSpec) -> Result<MachineDescriptor> {
        self.ensure_free(&spec.name)?;
        if spec.cores == 0 {
            return Err(AgentError::validation("cores", "must be at least 1"));
        }
        if spec.memory_mib == 0 {
            return Err(AgentError::validation("memory", "must be at least 1 MiB"));
        }

        let image = self.image.image_info(&spec.image)?;

        let mut descriptor = MachineDescriptor {
            index: self.next_index()?,
            kind: image.kind,
            image: image.name.clone(),
            cores: spec.cores,
            memory_mib: spec.memory_mib,
            disk_bytes: spec.disk_bytes,
            interfaces: spec
                .interfaces
                .into_iter()
                .filter(NetworkInterface::is_bridge)
                .collect(),
            runtime: RuntimeHandle::None,
            state: MachineState::Down,
            name: spec.name,
        };

        self.provision_interfaces(&mut descriptor.interfaces)
            .await?;

        let result = Machine::new(&self.ctx, &mut descriptor)
            .create(&image)
            .await;
        if let Err(e) = result {
            warn!("Failed to create machine {}: {}", descriptor.name, e);
            self.release_interfaces(&descriptor.interfaces).await;
            return Err(e);
        }

        self.persist(&descriptor)?;
        info!(
            "Created {} machine {} (index {})",
            descriptor.kind, descriptor.name, descriptor.index
        );

        Ok(descriptor)
    }

    /// Cores and memory take effect on the next start.
    pub async fn machine_update(
        &self,
        name: &str,
        update: MachineUpdate,
    ) -> Result<MachineDescriptor> {
        let mut descriptor = self.machine_info(name)?;

        if let Some(cores) = update.cores.filter(|c| *c > 0) {
            descriptor.cores = cores;
        }
        if let Some(memory_mib) = update.memory_mib.filter(|m| *m > 0) {
            descriptor.memory_mib = memory_mib;
        }

        let result = match &update.interfaces {
            Some(requested) => {
                self.ctx
                    .net
                    .reconcile(descriptor.index, &mut descriptor.interfaces, requested)
                    .await
            }
            None => Ok(()),
        };
        self.settle(&descriptor, result)?;

        if update.interfaces.is_some() && descriptor.state == MachineState::Up {
            self.arm_watchdog(&descriptor);
        }

        Ok(descriptor)
    }

    pub async fn machine_delete(&self, name: &str) -> Result<()> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor).delete().await;
        if result.is_err() {
            return self.settle(&descriptor, result);
        }
        self.disarm_watchdog(name);

        for (ordinal, iface) in descriptor.interfaces.iter().enumerate() {
            self.ctx.net.release(iface).await;
            self.ctx.net.device_remove(descriptor.index, ordinal).await;
        }

        self.store
            .delete::<MachineDescriptor>(name)
            .map_err(AgentError::Store)?;
        info!("Deleted machine {}", name);

        Ok(())
    }

    pub async fn machine_start(&self, name: &str) -> Result<MachineDescriptor> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor).start().await;
        self.settle(&descriptor, result)?;
        self.arm_watchdog(&descriptor);

        Ok(descriptor)
    }

    pub async fn machine_stop(&self, name: &str) -> Result<MachineDescriptor> {
        let mut descriptor = self.machine_info(name)?;
        self.disarm_watchdog(name);

        let result = Machine::new(&self.ctx, &mut descriptor).stop().await;
        self.settle(&descriptor, result)?;

        Ok(descriptor)
    }

    /// Re-derives the state from the host and records it.
    pub async fn machine_state(&self, name: &str) -> Result<MachineState> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor).state().await;
        let state = self.settle(&descriptor, result)?;
        if state == MachineState::Down {
            self.disarm_watchdog(name);
        }

        Ok(state)
    }

    /// Like [`MachineAgent::machine_state`], without writing anything back.
    pub async fn probe_state(&self, name: &str) -> Result<MachineState> {
        let mut descriptor = self.machine_info(name)?;
        Machine::new(&self.ctx, &mut descriptor).state().await
    }

    pub async fn machine_stats(&self, name: &str) -> Result<MachineStats> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor).stats().await;
        self.settle(&descriptor, result)
    }

    pub async fn machine_sysprep(&self, name: &str, hostname: &str, password: &str) -> Result<()> {
        validate_name("hostname", hostname)?;
        if password.is_empty() {
            return Err(AgentError::validation("password", "must not be empty"));
        }

        let mut descriptor = self.machine_info(name)?;
        let partition = self
            .image
            .image(&descriptor.image)?
            .map(|image| image.main_partition)
            .unwrap_or(1);

        let result = Machine::new(&self.ctx, &mut descriptor)
            .sysprep(partition, hostname, password)
            .await;
        self.settle(&descriptor, result)?;
        info!("Prepared {} as {}", name, hostname);

        Ok(())
    }

    /// Copies a stopped machine's storage under a new name. The copy gets fresh MACs and no IPs.
    pub async fn machine_clone(&self, name: &str, new_name: &str) -> Result<MachineDescriptor> {
        self.ensure_free(new_name)?;
        let mut source = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut source)
            .clone_storage(new_name)
            .await;
        self.settle(&source, result)?;

        let mut descriptor = MachineDescriptor {
            name: new_name.to_string(),
            index: self.next_index()?,
            interfaces: vec![NetworkInterface::bridge(); source.interfaces.len()],
            runtime: match source.kind {
                BackendKind::Hypervisor => RuntimeHandle::None,
                BackendKind::Container => RuntimeHandle::Container(new_name.to_string()),
            },
            state: MachineState::Down,
            ..source
        };

        if let Err(e) = self.provision_interfaces(&mut descriptor.interfaces).await {
            let dir = self.ctx.machine_dir(descriptor.kind, new_name);
            if let Err(e) = self.ctx.config.storage.destroy(&dir).await {
                warn!("Failed to remove storage of {}: {:#}", new_name, e);
            }
            return Err(e);
        }

        self.persist(&descriptor)?;
        info!("Cloned {} into {}", name, new_name);

        Ok(descriptor)
    }

    pub fn interface_list(&self, name: &str) -> Result<Vec<NetworkInterface>> {
        Ok(self.machine_info(name)?.interfaces)
    }

    /// Adds an interface at the end of the list; a running machine picks it up on its next start.
    pub async fn interface_create(
        &self,
        name: &str,
        mut iface: NetworkInterface,
    ) -> Result<NetworkInterface> {
        if !iface.is_bridge() {
            return Err(AgentError::validation("interface", "mode must be bridge"));
        }

        let mut descriptor = self.machine_info(name)?;
        self.ctx.net.provision(&mut iface).await?;

        descriptor.interfaces.push(iface.clone());
        self.persist(&descriptor)?;

        Ok(iface)
    }

    pub async fn interface_update(
        &self,
        name: &str,
        ordinal: usize,
        iface: NetworkInterface,
    ) -> Result<NetworkInterface> {
        let mut descriptor = self.machine_info(name)?;
        let Some(current) = descriptor.interfaces.get_mut(ordinal) else {
            return Err(AgentError::not_found("interface", ordinal.to_string()));
        };

        let result = self.ctx.net.update(current, &iface).await;
        let updated = current.clone();
        self.settle(&descriptor, result)?;

        Ok(updated)
    }

    /// Later interfaces shift down one ordinal, and so get new device names on the next start.
    pub async fn interface_delete(&self, name: &str, ordinal: usize) -> Result<()> {
        let mut descriptor = self.machine_info(name)?;
        if ordinal >= descriptor.interfaces.len() {
            return Err(AgentError::not_found("interface", ordinal.to_string()));
        }

        let iface = descriptor.interfaces.remove(ordinal);
        self.ctx.net.release(&iface).await;
        self.ctx.net.device_remove(descriptor.index, ordinal).await;

        self.persist(&descriptor)
    }

    pub async fn checkpoint_list(&self, name: &str) -> Result<Vec<String>> {
        let mut descriptor = self.machine_info(name)?;
        Machine::new(&self.ctx, &mut descriptor)
            .list_checkpoints()
            .await
    }

    pub async fn checkpoint_exists(&self, name: &str, checkpoint: &str) -> Result<bool> {
        let mut descriptor = self.machine_info(name)?;
        Machine::new(&self.ctx, &mut descriptor)
            .has_checkpoint(checkpoint)
            .await
    }

    pub async fn checkpoint_create(&self, name: &str, checkpoint: &str) -> Result<()> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor)
            .create_checkpoint(checkpoint)
            .await;
        self.settle(&descriptor, result)
    }

    /// May bring the machine up; the watchdog follows.
    pub async fn checkpoint_restore(&self, name: &str, checkpoint: &str) -> Result<()> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor)
            .restore_checkpoint(checkpoint)
            .await;
        self.settle(&descriptor, result)?;
        self.arm_watchdog(&descriptor);

        Ok(())
    }

    pub async fn checkpoint_delete(&self, name: &str, checkpoint: &str) -> Result<()> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor)
            .delete_checkpoint(checkpoint)
            .await;
        self.settle(&descriptor, result)
    }

    pub async fn backup_list(&self, name: &str) -> Result<Vec<Backup>> {
        let mut descriptor = self.machine_info(name)?;
        Machine::new(&self.ctx, &mut descriptor).list_backups().await
    }

    pub async fn backup_create(&self, name: &str) -> Result<Backup> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor)
            .create_backup()
            .await;
        let backup = self.settle(&descriptor, result)?;
        info!("Created backup {} of {}", backup.name(), name);

        Ok(backup)
    }

    pub async fn backup_restore(&self, name: &str, backup: Backup) -> Result<()> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor)
            .restore_backup(backup)
            .await;
        self.settle(&descriptor, result)
    }

    pub async fn backup_delete(&self, name: &str, backup: Backup) -> Result<()> {
        let mut descriptor = self.machine_info(name)?;

        let result = Machine::new(&self.ctx, &mut descriptor)
            .delete_backup(backup)
            .await;
        self.settle(&descriptor, result)
    }

    /// Starts a watchdog for an up machine with bridged interfaces, replacing any previous one.
    fn arm_watchdog(&self, descriptor: &MachineDescriptor) {
        let Some(config) = &self.ctx.config.watchdog else {
            return;
        };
        if descriptor.state != MachineState::Up {
            return;
        }
        let devices = descriptor.bridge_devices();
        if devices.is_empty() {
            return;
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .watchdogs
            .pin()
            .insert(descriptor.name.clone(), cancel.clone())
        {
            previous.cancel();
        }

        let target: Weak<dyn WatchdogTarget> = self.this.clone();
        Watchdog {
            machine: descriptor.name.clone(),
            devices,
            config: config.clone(),
            counters: self.counters.clone(),
            notifier: self.notifier.clone(),
            target,
            cancel,
        }
        .spawn();
    }

    fn disarm_watchdog(&self, name: &str) {
        if let Some(cancel) = self.watchdogs.pin().remove(name) {
            cancel.cancel();
        }
    }

    pub fn watchdog_armed(&self, name: &str) -> bool {
        self.watchdogs
            .pin()
            .get(name)
            .is_some_and(|cancel| !cancel.is_cancelled())
    }

    /// Hypervisor processes outlive the agent; their watchdogs do not.
    pub async fn rearm_watchdogs(&self) -> Result<()> {
        for descriptor in self.machine_list()? {
            match self.machine_state(&descriptor.name).await {
                Ok(MachineState::Up) => {
                    info!("Machine {} is still up", descriptor.name);
                    let descriptor = self.machine_info(&descriptor.name)?;
                    self.arm_watchdog(&descriptor);
                }
                Ok(MachineState::Down) => {}
                Err(e) => warn!("Failed to probe {}: {}", descriptor.name, e),
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let watchdogs = self.watchdogs.pin();
        for cancel in watchdogs.values() {
            cancel.cancel();
        }
        watchdogs.clear();
    }
}

#[async_trait]
impl WatchdogTarget for MachineAgent {
    async fn is_up(&self, machine: &str) -> bool {
        matches!(self.probe_state(machine).await, Ok(MachineState::Up))
    }

    async fn stop_for_traffic(&self, machine: &str) -> anyhow::Result<()> {
        self.machine_stop(machine).await?;
        Ok(())
    }
}
