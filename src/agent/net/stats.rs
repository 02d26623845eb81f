use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Per-device packet counters, used by the traffic watchdog.
#[async_trait]
pub trait PacketCounters: Send + Sync {
    /// Transmitted packets so far, or `None` once the device is gone.
    async fn tx_packets(&self, device: &str) -> Result<Option<u64>>;
}

pub struct SysfsCounters {
    root: PathBuf,
}

impl SysfsCounters {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsCounters {
    fn default() -> Self {
        Self::new("/sys/class/net")
    }
}

#[async_trait]
impl PacketCounters for SysfsCounters {
    async fn tx_packets(&self, device: &str) -> Result<Option<u64>> {
        let device_dir = self.root.join(device);
        if !device_dir.exists() {
            return Ok(None);
        }

        let path = device_dir.join("statistics").join("tx_packets");
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid counter in {}", path.display()))?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sysfs_counters() {
        let dir = tempfile::tempdir().unwrap();
        let stats = dir.path().join("veth3.0/statistics");
        std::fs::create_dir_all(&stats).unwrap();
        std::fs::write(stats.join("tx_packets"), "4242\n").unwrap();

        let counters = SysfsCounters::new(dir.path());
        assert_eq!(counters.tx_packets("veth3.0").await.unwrap(), Some(4242));
        assert_eq!(counters.tx_packets("veth9.0").await.unwrap(), None);
    }
}
