pub mod device;
pub mod filter;
pub mod stats;

use std::{net::Ipv4Addr, sync::Arc};

use tracing::{info, warn};

use crate::{
    agent::{
        error::{AgentError, Result, StageContext},
        machine::machine::NetworkInterface,
        net::{device::DeviceControl, filter::TrafficFilter},
    },
    constants::{ANY_IP, MAC_PREFIX},
};

const MAX_DEVICE_NAME_LEN: usize = 15;
const MAC_ALLOCATION_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct NetAgentConfig {
    pub bridge_name: String,
    /// Embedded as the third octet of every synthesized MAC.
    pub node_id: u8,
}

/// Host device name of interface `ordinal` on the machine with `index`.
pub fn device_name(index: u32, ordinal: usize) -> Result<String> {
    let name = format!("veth{index}.{ordinal}");
    if name.len() > MAX_DEVICE_NAME_LEN {
        return Err(AgentError::validation(
            "interface",
            format!("device name {name} exceeds {MAX_DEVICE_NAME_LEN} characters"),
        ));
    }
    Ok(name)
}

pub fn generate_mac(node_id: u8) -> String {
    let tail: [u8; 3] = rand::random();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        MAC_PREFIX[0], MAC_PREFIX[1], node_id, tail[0], tail[1], tail[2]
    )
}

fn validate_mac(mac: &str) -> Result<()> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| (1..=2).contains(&o.len()) && u8::from_str_radix(o, 16).is_ok());

    if !valid {
        return Err(AgentError::validation("mac", format!("'{mac}' is not a MAC address")));
    }
    Ok(())
}

fn validate_ip(ip: &str) -> Result<()> {
    ip.parse::<Ipv4Addr>()
        .map_err(|_| AgentError::validation("ip", format!("'{ip}' is not an IPv4 address")))?;
    Ok(())
}

pub struct NetAgent {
    config: NetAgentConfig,
    devices: Arc<dyn DeviceControl>,
    filter: Arc<dyn TrafficFilter>,
}

impl NetAgent {
    pub fn new(
        config: NetAgentConfig,
        devices: Arc<dyn DeviceControl>,
        filter: Arc<dyn TrafficFilter>,
    ) -> Self {
        Self {
            config,
            devices,
            filter,
        }
    }

    pub fn bridge_name(&self) -> &str {
        &self.config.bridge_name
    }

    /// Checks the shared bridge is present and installs the default-deny chain.
    pub async fn init(&self) -> Result<()> {
        let bridge = &self.config.bridge_name;
        if !self.devices.exists(bridge).await.stage("bridge lookup")? {
            return Err(AgentError::not_found("bridge", bridge));
        }

        self.filter.ensure_chain().await.stage("traffic chain")?;
        info!("Traffic chain ready on bridge {}", bridge);

        Ok(())
    }

    async fn allocate_mac(&self) -> Result<String> {
        for _ in 0..MAC_ALLOCATION_ATTEMPTS {
            let mac = generate_mac(self.config.node_id);
            if !self
                .filter
                .is_granted(&mac, ANY_IP)
                .await
                .stage("traffic lookup")?
            {
                return Ok(mac);
            }
        }

        Err(AgentError::ExternalTool {
            stage: "mac allocation",
            source: anyhow::anyhow!("no free MAC after {MAC_ALLOCATION_ATTEMPTS} attempts"),
        })
    }

    /// A MAC backs at most one interface on the node; its bootstrap rule marks it taken.
    async fn ensure_mac_free(&self, mac: &str) -> Result<()> {
        if self
            .filter
            .is_granted(mac, ANY_IP)
            .await
            .stage("traffic lookup")?
        {
            return Err(AgentError::AlreadyExists {
                kind: "mac",
                name: mac.to_string(),
            });
        }
        Ok(())
    }

    /// Assigns a MAC if missing and grants the bootstrap and bound-IP rules.
    pub async fn provision(&self, iface: &mut NetworkInterface) -> Result<()> {
        if !iface.is_bridge() {
            return Ok(());
        }

        let mac = match iface.mac.clone() {
            Some(mac) => {
                validate_mac(&mac)?;
                self.ensure_mac_free(&mac).await?;
                mac
            }
            None => self.allocate_mac().await?,
        };
        if let Some(ip) = &iface.ip {
            validate_ip(ip)?;
        }

        self.filter.grant(&mac, ANY_IP).await.stage("traffic grant")?;
        if let Some(ip) = &iface.ip {
            self.filter.grant(&mac, ip).await.stage("traffic grant")?;
        }

        iface.mac = Some(mac);
        Ok(())
    }

    /// Revokes both rules of an interface. Missing rules are not an error.
    pub async fn release(&self, iface: &NetworkInterface) {
        let Some(mac) = &iface.mac else {
            return;
        };

        let ips = std::iter::once(ANY_IP).chain(iface.ip.as_deref());
        for ip in ips {
            if let Err(e) = self.filter.revoke(mac, ip).await {
                warn!("Failed to revoke traffic rule {} {}: {:#}", mac, ip, e);
            }
        }
    }

    /// Re-grants whichever rule of the interface went missing.
    pub async fn verify(&self, iface: &NetworkInterface) -> Result<()> {
        let Some(mac) = &iface.mac else {
            return Ok(());
        };
        if !iface.is_bridge() {
            return Ok(());
        }

        let ips = std::iter::once(ANY_IP).chain(iface.ip.as_deref());
        for ip in ips {
            if !self
                .filter
                .is_granted(mac, ip)
                .await
                .stage("traffic lookup")?
            {
                warn!("Traffic rule {} {} missing, granting again", mac, ip);
                self.filter.grant(mac, ip).await.stage("traffic grant")?;
            }
        }

        Ok(())
    }

    pub async fn update(
        &self,
        current: &mut NetworkInterface,
        requested: &NetworkInterface,
    ) -> Result<()> {
        if let Some(mac) = &requested.mac {
            if current.mac.as_ref() != Some(mac) {
                validate_mac(mac)?;
                self.ensure_mac_free(mac).await?;
            }
        }

        self.release(current).await;

        current.mode = requested.mode;
        if requested.mac.is_some() {
            current.mac = requested.mac.clone();
        }
        if requested.ip.is_some() {
            current.ip = requested.ip.clone();
        }

        self.provision(current).await
    }

    /// Brings `current` in line with `requested`: interfaces past the end of `requested` are
    /// released and their devices removed.
    pub async fn reconcile(
        &self,
        index: u32,
        current: &mut Vec<NetworkInterface>,
        requested: &[NetworkInterface],
    ) -> Result<()> {
        while current.len() > requested.len() {
            let ordinal = current.len() - 1;
            if let Some(iface) = current.pop() {
                self.release(&iface).await;
            }
            self.device_remove(index, ordinal).await;
        }

        for (ordinal, wanted) in requested.iter().enumerate() {
            match current.get_mut(ordinal) {
                Some(existing) if existing == wanted => {}
                Some(existing) => self.update(existing, wanted).await?,
                None => {
                    let mut iface = wanted.clone();
                    self.provision(&mut iface).await?;
                    current.push(iface);
                }
            }
        }

        Ok(())
    }

    /// Opens the persistent TAP for an interface and enslaves it to the bridge.
    pub async fn tap_up(&self, index: u32, ordinal: usize) -> Result<String> {
        let name = device_name(index, ordinal)?;

        self.devices.create_tap(&name).await.stage("tap create")?;
        self.devices
            .attach_to_bridge(&name, &self.config.bridge_name)
            .await
            .stage("bridge attach")?;

        Ok(name)
    }

    pub async fn tap_release(&self, index: u32, ordinal: usize) {
        let Ok(name) = device_name(index, ordinal) else {
            return;
        };

        if let Err(e) = self.devices.release_tap(&name).await {
            warn!("Failed to release tap {}: {:#}", name, e);
        }
    }

    pub async fn device_remove(&self, index: u32, ordinal: usize) {
        let Ok(name) = device_name(index, ordinal) else {
            return;
        };

        match self.devices.exists(&name).await {
            Ok(true) => {
                if let Err(e) = self.devices.delete(&name).await {
                    warn!("Failed to delete device {}: {:#}", name, e);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to look up device {}: {:#}", name, e),
        }
    }

    pub async fn is_granted(&self, mac: &str, ip: &str) -> Result<bool> {
        self.filter.is_granted(mac, ip).await.stage("traffic lookup")
    }
}
