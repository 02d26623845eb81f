pub mod data;
pub mod disk;
pub mod error;
pub mod image;
pub mod machine;
pub mod migration;
pub mod net;
pub mod storage;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::{
    agent::{
        disk::{BlockDevice, DiskAgent, DiskTool},
        image::{ImageAgent, ImageAgentConfig},
        machine::{
            MachineAgent, MachineAgentConfig, MachineBindings,
            container::runtime::ContainerRuntime, hypervisor::monitor::ControlChannel,
            watchdog::Notifier,
        },
        migration::{
            MigrationAgent, MigrationAgentConfig,
            remote::{RemoteConnector, Transfer},
        },
        net::{
            NetAgent, NetAgentConfig, device::DeviceControl, filter::TrafficFilter,
            stats::PacketCounters,
        },
    },
    machinery::store::Store,
};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub store_path: String,
    pub net_config: NetAgentConfig,
    pub image_config: ImageAgentConfig,
    pub machine_config: MachineAgentConfig,
    pub migration_config: MigrationAgentConfig,
}

/// Host tools and peers the agents act through.
pub struct HostBindings {
    pub devices: Arc<dyn DeviceControl>,
    pub filter: Arc<dyn TrafficFilter>,
    pub disk_tool: Arc<dyn DiskTool>,
    pub block: Arc<dyn BlockDevice>,
    pub control: Arc<dyn ControlChannel>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub counters: Arc<dyn PacketCounters>,
    pub notifier: Arc<dyn Notifier>,
    pub remotes: Arc<dyn RemoteConnector>,
    pub transfer: Arc<dyn Transfer>,
}

pub struct Agent {
    net: Arc<NetAgent>,
    disk: Arc<DiskAgent>,
    image: Arc<ImageAgent>,
    machine: Arc<MachineAgent>,
    migration: Arc<MigrationAgent>,
}

impl Agent {
    pub async fn new(config: AgentConfig, host: HostBindings) -> Result<Self> {
        let store = Arc::new(Store::new(&config.store_path).await?);

        let net = Arc::new(NetAgent::new(
            config.net_config.clone(),
            host.devices,
            host.filter,
        ));
        let disk = Arc::new(DiskAgent::new(host.disk_tool, host.block));

        let image = Arc::new(ImageAgent::new(config.image_config.clone(), store.clone()).await?);

        let machine = MachineAgent::new(
            config.machine_config.clone(),
            store.clone(),
            image.clone(),
            net.clone(),
            disk.clone(),
            MachineBindings {
                control: host.control,
                runtime: host.runtime,
                counters: host.counters,
                notifier: host.notifier,
            },
        )
        .await?;

        let migration = Arc::new(MigrationAgent::new(
            config.migration_config.clone(),
            machine.clone(),
            image.clone(),
            host.remotes,
            host.transfer,
        ));

        Ok(Self {
            net,
            disk,
            image,
            machine,
            migration,
        })
    }

    /// Node bookkeeping before serving: the bridge and filter chain must be in place, and
    /// machines that outlived a previous agent get their watchdogs back.
    pub async fn init(&self) -> Result<()> {
        self.net.init().await?;
        self.machine.rearm_watchdogs().await?;
        info!("Agent ready");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.machine.shutdown();
    }

    pub fn net(&self) -> Arc<NetAgent> {
        self.net.clone()
    }

    pub fn disk(&self) -> Arc<DiskAgent> {
        self.disk.clone()
    }

    pub fn image(&self) -> Arc<ImageAgent> {
        self.image.clone()
    }

    pub fn machine(&self) -> Arc<MachineAgent> {
        self.machine.clone()
    }

    pub fn migration(&self) -> Arc<MigrationAgent> {
        self.migration.clone()
    }
}
