use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::utils::cmd;

/// Default-deny layer-2 allow list keyed by (MAC, source IP).
#[async_trait]
pub trait TrafficFilter: Send + Sync {
    /// Creates the filtering chain with a DROP policy if it does not exist yet.
    async fn ensure_chain(&self) -> Result<()>;

    async fn grant(&self, mac: &str, ip: &str) -> Result<()>;

    async fn revoke(&self, mac: &str, ip: &str) -> Result<()>;

    async fn is_granted(&self, mac: &str, ip: &str) -> Result<bool>;
}

/// ebtables prints MAC octets without leading zeros ("52:54:1:a:b:c").
pub fn normalize_mac(mac: &str) -> String {
    mac.split(':')
        .map(|octet| {
            let trimmed = octet.trim_start_matches('0');
            let octet = if trimmed.is_empty() { "0" } else { trimmed };
            octet.to_ascii_lowercase()
        })
        .collect::<Vec<_>>()
        .join(":")
}

/// Whether a listed ebtables rule accepts `ip` traffic sourced from `mac`.
pub fn rule_matches(rule: &str, mac: &str, ip: &str) -> bool {
    let tokens: Vec<&str> = rule.split_whitespace().collect();
    let value_of = |flag: &str| {
        tokens
            .iter()
            .position(|t| *t == flag)
            .and_then(|i| tokens.get(i + 1))
            .copied()
    };

    let accepts = value_of("-j") == Some("ACCEPT");
    let mac_matches = value_of("-s").map(normalize_mac) == Some(normalize_mac(mac));
    let ip_matches = value_of("--ip-src") == Some(ip);

    accepts && mac_matches && ip_matches
}

pub struct Ebtables {
    binary: PathBuf,
    chain: String,
    device_pattern: String,
}

impl Ebtables {
    pub fn new(binary: impl Into<PathBuf>, chain: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            chain: chain.into(),
            device_pattern: "veth+".to_string(),
        }
    }

    fn rule_args<'a>(&'a self, op: &'a str, mac: &'a str, ip: &'a str) -> [&'a str; 10] {
        [
            op,
            self.chain.as_str(),
            "-p",
            "ip",
            "--ip-src",
            ip,
            "-s",
            mac,
            "-j",
            "ACCEPT",
        ]
    }
}

#[async_trait]
impl TrafficFilter for Ebtables {
    async fn ensure_chain(&self) -> Result<()> {
        if cmd::run(&self.binary, ["-L", self.chain.as_str()]).await.is_ok() {
            return Ok(());
        }

        cmd::run(&self.binary, ["-N", self.chain.as_str(), "-P", "DROP"]).await?;
        cmd::run(
            &self.binary,
            [
                "-A",
                "FORWARD",
                "-p",
                "ip",
                "-i",
                self.device_pattern.as_str(),
                "-j",
                self.chain.as_str(),
            ],
        )
        .await?;

        Ok(())
    }

    async fn grant(&self, mac: &str, ip: &str) -> Result<()> {
        cmd::run(&self.binary, self.rule_args("-A", mac, ip)).await?;
        Ok(())
    }

    async fn revoke(&self, mac: &str, ip: &str) -> Result<()> {
        cmd::run(&self.binary, self.rule_args("-D", mac, ip)).await?;
        Ok(())
    }

    async fn is_granted(&self, mac: &str, ip: &str) -> Result<bool> {
        let rules = cmd::run(&self.binary, ["-L", self.chain.as_str()]).await?;
        Ok(rules.lines().any(|rule| rule_matches(rule, mac, ip)))
    }
}
