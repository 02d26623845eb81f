mod cmd;
mod config;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kiln::{
    agent::{
        Agent, HostBindings,
        disk::{HostNbd, QemuImg},
        machine::{
            container::runtime::LxcRuntime, hypervisor::monitor::QmpChannel,
            watchdog::LogNotifier,
        },
        migration::remote::{HttpRemotes, SshTransfer},
        net::{device::HostDevices, filter::Ebtables, stats::SysfsCounters},
    },
    utils::tracing::init_tracing,
};
use tracing::info;

use crate::{cmd::Cli, config::Config};

fn host_bindings(config: &Config) -> HostBindings {
    let hypervisor = &config.hypervisor_config;

    HostBindings {
        devices: Arc::new(HostDevices),
        filter: Arc::new(Ebtables::new(
            config.net_config.ebtables.clone(),
            config.net_config.traffic_chain.clone(),
        )),
        disk_tool: Arc::new(QemuImg::new(hypervisor.image_tool.clone())),
        block: Arc::new(HostNbd::new(
            hypervisor.nbd_tool.clone(),
            hypervisor.nbd_device.clone(),
        )),
        control: Arc::new(QmpChannel),
        runtime: Arc::new(LxcRuntime::new(config.lxc_path())),
        counters: Arc::new(SysfsCounters::default()),
        notifier: Arc::new(LogNotifier),
        remotes: Arc::new(HttpRemotes::default()),
        transfer: Arc::new(SshTransfer::new(config.node_config.ssh_user.clone())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config_path).await?;
    info!("Loaded config from {}", config.config_path.display());

    let agent = Agent::new(config.agent_config(), host_bindings(&config)).await?;
    agent.init().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    agent.shutdown();

    Ok(())
}
