use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Result, bail};
use kiln::{
    agent::{
        AgentConfig,
        image::ImageAgentConfig,
        machine::{MachineAgentConfig, machine::BackendKind, watchdog::WatchdogConfig},
        migration::MigrationAgentConfig,
        net::NetAgentConfig,
        storage::StorageBackend,
    },
    constants::{DEFAULT_NBD_DEVICE, DEFAULT_START_GRACE_MS, DEFAULT_TRAFFIC_CHAIN},
};
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(skip_serializing, skip_deserializing)]
    pub config_path: PathBuf,
    #[serde(skip_serializing, skip_deserializing)]
    pub config_dir: PathBuf,

    #[serde(rename = "node")]
    pub node_config: NodeConfig,

    #[serde(rename = "paths")]
    pub paths: PathsConfig,

    #[serde(rename = "storage", default)]
    pub storage: StorageBackend,

    #[serde(rename = "net")]
    pub net_config: NetConfig,

    #[serde(rename = "hypervisor", default)]
    pub hypervisor_config: HypervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Third octet of every MAC this node synthesizes.
    #[serde(rename = "node-id")]
    pub node_id: u8,
    /// Address peers use to pull image content from this node.
    #[serde(rename = "advertise-host")]
    pub advertise_host: String,
    #[serde(rename = "ssh-user")]
    pub ssh_user: Option<String>,
    #[serde(rename = "password-tool", default = "default_password_tool")]
    pub password_tool: String,
}

/// Relative paths are taken from the config file's directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    #[serde(rename = "store")]
    pub store: PathBuf,
    #[serde(rename = "images")]
    pub images: PathBuf,
    #[serde(rename = "machines")]
    pub machines: PathBuf,
    #[serde(rename = "migration")]
    pub migration: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetConfig {
    #[serde(rename = "bridge-name")]
    pub bridge_name: String,
    #[serde(rename = "traffic-chain", default = "default_traffic_chain")]
    pub traffic_chain: String,
    #[serde(rename = "ebtables", default = "default_ebtables")]
    pub ebtables: PathBuf,
    /// Packet-rate watchdog; absent means no monitoring.
    #[serde(rename = "monitor")]
    pub monitor: Option<MonitorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(rename = "alert-pps")]
    pub alert_pps: u64,
    #[serde(rename = "stop-pps")]
    pub stop_pps: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HypervisorConfig {
    #[serde(rename = "binary")]
    pub binary: String,
    #[serde(rename = "image-tool")]
    pub image_tool: PathBuf,
    #[serde(rename = "nbd-tool")]
    pub nbd_tool: PathBuf,
    #[serde(rename = "nbd-device")]
    pub nbd_device: String,
    #[serde(rename = "enable-kvm")]
    pub enable_kvm: bool,
    #[serde(rename = "start-grace-ms")]
    pub start_grace_ms: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
            image_tool: PathBuf::from("qemu-img"),
            nbd_tool: PathBuf::from("qemu-nbd"),
            nbd_device: DEFAULT_NBD_DEVICE.to_string(),
            enable_kvm: true,
            start_grace_ms: DEFAULT_START_GRACE_MS,
        }
    }
}

fn default_traffic_chain() -> String {
    DEFAULT_TRAFFIC_CHAIN.to_string()
}

fn default_password_tool() -> String {
    "openssl".to_string()
}

fn default_ebtables() -> PathBuf {
    PathBuf::from("ebtables")
}

async fn resolve_config_path(path_override: Option<PathBuf>) -> Result<PathBuf> {
    let config_path =
        path_override.or_else(|| std::env::var("KILN_CONFIG").ok().map(PathBuf::from));

    if let Some(path) = config_path {
        return Ok(path);
    }

    warn!("No config path override found, looking for config in default locations");

    let path = std::env::current_dir()?.join("kiln.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in current directory ({})", path.display());

    let Some(project_dirs) = directories::ProjectDirs::from("org", "kiln", "kiln") else {
        bail!("Failed to get config dir");
    };
    let path = project_dirs.config_dir().join("config.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in home config dir ({})", path.display());

    let path = PathBuf::from("/etc/kiln/config.toml");
    if path.exists() {
        return Ok(path);
    }
    warn!("No config found in global config dir ({})", path.display());

    bail!("Couldn't load config file.");
}

impl Config {
    pub async fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = resolve_config_path(path_override).await?;
        let config_str = read_to_string(&config_path).await?;

        Self::parse(&config_str, config_path)
    }

    fn parse(raw: &str, config_path: PathBuf) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;

        let Some(config_dir) = config_path.parent().map(Path::to_path_buf) else {
            bail!("Couldn't determine config dir");
        };
        config.config_path = config_path;
        config.config_dir = config_dir;

        Ok(config)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        self.config_dir.join(path)
    }

    fn absolute_string(&self, path: &Path) -> String {
        self.absolute(path).to_string_lossy().to_string()
    }

    /// lxc keeps its containers in the container storage directory under `paths.machines`.
    pub fn lxc_path(&self) -> PathBuf {
        self.absolute(&self.paths.machines)
            .join(BackendKind::Container.dir_name())
    }

    pub fn agent_config(&self) -> AgentConfig {
        let hypervisor = &self.hypervisor_config;

        AgentConfig {
            store_path: self.absolute_string(&self.paths.store),
            net_config: NetAgentConfig {
                bridge_name: self.net_config.bridge_name.clone(),
                node_id: self.node_config.node_id,
            },
            image_config: ImageAgentConfig {
                base_path: self.absolute_string(&self.paths.images),
                ssh_user: self.node_config.ssh_user.clone(),
            },
            machine_config: MachineAgentConfig {
                base_path: self.absolute_string(&self.paths.machines),
                migration_path: self.absolute_string(&self.paths.migration),
                hypervisor_binary: hypervisor.binary.clone(),
                enable_kvm: hypervisor.enable_kvm,
                start_grace: Duration::from_millis(hypervisor.start_grace_ms),
                storage: Clone::clone(&self.storage),
                password_tool: self.node_config.password_tool.clone(),
                watchdog: self
                    .net_config
                    .monitor
                    .as_ref()
                    .map(|m| WatchdogConfig::new(m.alert_pps, m.stop_pps)),
            },
            migration_config: MigrationAgentConfig {
                advertise_host: self.node_config.advertise_host.clone(),
            },
        }
    }
}
