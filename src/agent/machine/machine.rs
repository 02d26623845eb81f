use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    agent::{
        error::Result,
        image::Image,
        machine::{MachineContext, container::ContainerMachine, hypervisor::HypervisorMachine},
        net::device_name,
    },
    constants::BACKUP_PREFIX,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Hypervisor,
    Container,
}

impl BackendKind {
    /// Directory name under the machine and image roots.
    pub fn dir_name(&self) -> &'static str {
        match self {
            BackendKind::Hypervisor => "qemu",
            BackendKind::Container => "lxc",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Hypervisor => write!(f, "hypervisor"),
            BackendKind::Container => write!(f, "container"),
        }
    }
}

/// Destroyed is not represented: a deleted machine has no record left.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    #[default]
    Down,
    Up,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Down => write!(f, "down"),
            MachineState::Up => write!(f, "up"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    None,
    Bridge,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NetworkInterface {
    pub mode: NetworkMode,
    pub mac: Option<String>,
    pub ip: Option<String>,
}

impl NetworkInterface {
    pub fn bridge() -> Self {
        Self {
            mode: NetworkMode::Bridge,
            mac: None,
            ip: None,
        }
    }

    pub fn is_bridge(&self) -> bool {
        self.mode == NetworkMode::Bridge
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuntimeHandle {
    #[default]
    None,
    Pid(i32),
    Container(String),
}

/// What a caller asks for; the agent turns it into a [`MachineDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: String,
    pub image: String,
    pub cores: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub disk_bytes: u64,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineDescriptor {
    pub name: String,
    pub index: u32,
    pub kind: BackendKind,
    pub image: String,
    pub cores: u32,
    pub memory_mib: u64,
    pub disk_bytes: u64,
    pub interfaces: Vec<NetworkInterface>,
    pub runtime: RuntimeHandle,
    pub state: MachineState,
}

impl MachineDescriptor {
    pub fn spec(&self) -> MachineSpec {
        MachineSpec {
            name: self.name.clone(),
            image: self.image.clone(),
            cores: self.cores,
            memory_mib: self.memory_mib,
            disk_bytes: self.disk_bytes,
            interfaces: self.interfaces.clone(),
        }
    }

    pub fn pid(&self) -> Option<i32> {
        match self.runtime {
            RuntimeHandle::Pid(pid) if pid > 0 => Some(pid),
            _ => None,
        }
    }

    /// Host devices carrying the machine's bridged traffic.
    pub fn bridge_devices(&self) -> Vec<String> {
        self.interfaces
            .iter()
            .enumerate()
            .filter(|(_, iface)| iface.is_bridge())
            .filter_map(|(ordinal, _)| device_name(self.index, ordinal).ok())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineUpdate {
    pub cores: Option<u32>,
    pub memory_mib: Option<u64>,
    pub interfaces: Option<Vec<NetworkInterface>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MachineStats {
    pub cpu_percent: f32,
    pub ram_used_bytes: u64,
    pub ram_free_bytes: u64,
}

impl MachineStats {
    pub fn new(cpu_percent: f32, ram_used_bytes: u64, memory_mib: u64) -> Self {
        Self {
            cpu_percent,
            ram_used_bytes,
            ram_free_bytes: (memory_mib * 1024 * 1024).saturating_sub(ram_used_bytes),
        }
    }
}

/// Cold point-in-time disk state, named after its creation time (unix seconds).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Backup {
    pub timestamp: i64,
}

impl Backup {
    pub fn name(&self) -> String {
        format!("{}{}", BACKUP_PREFIX, self.timestamp)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let timestamp = name.strip_prefix(BACKUP_PREFIX)?.parse().ok()?;
        Some(Self { timestamp })
    }
}

/// A descriptor bound to the backend its kind selects.
pub enum Machine<'a> {
    Hypervisor(HypervisorMachine<'a>),
    Container(ContainerMachine<'a>),
}

macro_rules! dispatch {
    ($self:ident, $machine:ident => $call:expr) => {
        match $self {
            Machine::Hypervisor($machine) => $call,
            Machine::Container($machine) => $call,
        }
    };
}

impl<'a> Machine<'a> {
    pub fn new(ctx: &'a MachineContext, descriptor: &'a mut MachineDescriptor) -> Self {
        match descriptor.kind {
            BackendKind::Hypervisor => Machine::Hypervisor(HypervisorMachine::new(ctx, descriptor)),
            BackendKind::Container => Machine::Container(ContainerMachine::new(ctx, descriptor)),
        }
    }

    pub async fn create(&mut self, image: &Image) -> Result<()> {
        dispatch!(self, m => m.create(image).await)
    }

    pub async fn delete(&mut self) -> Result<()> {
        dispatch!(self, m => m.delete().await)
    }

    pub async fn start(&mut self) -> Result<()> {
        dispatch!(self, m => m.start().await)
    }

    pub async fn stop(&mut self) -> Result<()> {
        dispatch!(self, m => m.stop().await)
    }

    pub async fn state(&mut self) -> Result<MachineState> {
        dispatch!(self, m => m.state().await)
    }

    pub async fn stats(&mut self) -> Result<MachineStats> {
        dispatch!(self, m => m.stats().await)
    }

    /// `partition` is the image's main partition; containers have none.
    pub async fn sysprep(&mut self, partition: u32, hostname: &str, password: &str) -> Result<()> {
        match self {
            Machine::Hypervisor(m) => m.sysprep(partition, hostname, password).await,
            Machine::Container(m) => m.sysprep(hostname, password).await,
        }
    }

    pub async fn clone_storage(&mut self, new_name: &str) -> Result<()> {
        dispatch!(self, m => m.clone_storage(new_name).await)
    }

    pub async fn list_checkpoints(&mut self) -> Result<Vec<String>> {
        dispatch!(self, m => m.list_checkpoints().await)
    }

    pub async fn has_checkpoint(&mut self, name: &str) -> Result<bool> {
        dispatch!(self, m => m.has_checkpoint(name).await)
    }

    pub async fn create_checkpoint(&mut self, name: &str) -> Result<()> {
        dispatch!(self, m => m.create_checkpoint(name).await)
    }

    pub async fn restore_checkpoint(&mut self, name: &str) -> Result<()> {
        dispatch!(self, m => m.restore_checkpoint(name).await)
    }

    pub async fn delete_checkpoint(&mut self, name: &str) -> Result<()> {
        dispatch!(self, m => m.delete_checkpoint(name).await)
    }

    pub async fn list_backups(&mut self) -> Result<Vec<Backup>> {
        dispatch!(self, m => m.list_backups().await)
    }

    pub async fn create_backup(&mut self) -> Result<Backup> {
        dispatch!(self, m => m.create_backup().await)
    }

    pub async fn restore_backup(&mut self, backup: Backup) -> Result<()> {
        dispatch!(self, m => m.restore_backup(backup).await)
    }

    pub async fn delete_backup(&mut self, backup: Backup) -> Result<()> {
        dispatch!(self, m => m.delete_backup(backup).await)
    }
}
