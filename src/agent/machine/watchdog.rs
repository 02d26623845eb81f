use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agent::net::stats::PacketCounters,
    constants::{
        DEFAULT_WATCHDOG_ALERT_BACKOFF_SECS, DEFAULT_WATCHDOG_INTERVAL_SECS,
        DEFAULT_WATCHDOG_SAMPLE_SECS,
    },
};

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub alert_pps: u64,
    pub stop_pps: u64,
    /// Pause between two samples while traffic is normal.
    pub interval: Duration,
    /// Window over which one packet rate is measured.
    pub sample: Duration,
    /// Pause after an alert, so a noisy machine does not flood the notifier.
    pub alert_backoff: Duration,
}

impl WatchdogConfig {
    pub fn new(alert_pps: u64, stop_pps: u64) -> Self {
        Self {
            alert_pps,
            stop_pps,
            interval: Duration::from_secs(DEFAULT_WATCHDOG_INTERVAL_SECS),
            sample: Duration::from_secs(DEFAULT_WATCHDOG_SAMPLE_SECS),
            alert_backoff: Duration::from_secs(DEFAULT_WATCHDOG_ALERT_BACKOFF_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Alert,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub machine: String,
    pub device: String,
    pub packets_per_second: u64,
    pub level: AlertLevel,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert);
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) {
        warn!(
            machine = %alert.machine,
            device = %alert.device,
            pps = alert.packets_per_second,
            level = ?alert.level,
            "Traffic threshold crossed"
        );
    }
}

/// The machine side of a watchdog.
#[async_trait]
pub trait WatchdogTarget: Send + Sync {
    async fn is_up(&self, machine: &str) -> bool;

    async fn stop_for_traffic(&self, machine: &str) -> anyhow::Result<()>;
}

pub struct Watchdog {
    pub machine: String,
    pub devices: Vec<String>,
    pub config: WatchdogConfig,
    pub counters: Arc<dyn PacketCounters>,
    pub notifier: Arc<dyn Notifier>,
    pub target: Weak<dyn WatchdogTarget>,
    pub cancel: CancellationToken,
}

impl Watchdog {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn read_all(&self) -> Option<Vec<u64>> {
        let mut values = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            match self.counters.tx_packets(device).await {
                Ok(Some(value)) => values.push(value),
                Ok(None) => {
                    info!("Device {} of {} is gone", device, self.machine);
                    return None;
                }
                Err(e) => {
                    warn!("Failed to read counters of {}: {:#}", device, e);
                    return None;
                }
            }
        }
        Some(values)
    }

    /// Busiest device and its packet rate over one sample window. `None` ends the watchdog.
    async fn measure(&self) -> Option<(usize, u64)> {
        let before = self.read_all().await?;

        tokio::select! {
            _ = self.cancel.cancelled() => return None,
            _ = tokio::time::sleep(self.config.sample) => {}
        }

        let after = self.read_all().await?;
        let sample_ms = self.config.sample.as_millis().max(1) as u64;

        before
            .iter()
            .zip(after.iter())
            .map(|(b, a)| a.saturating_sub(*b) * 1000 / sample_ms)
            .enumerate()
            .max_by_key(|(_, pps)| *pps)
    }

    async fn notify(&self, device: usize, pps: u64, level: AlertLevel) {
        let alert = Alert {
            machine: self.machine.clone(),
            device: self.devices[device].clone(),
            packets_per_second: pps,
            level,
        };
        self.notifier.notify(&alert).await;
    }

    async fn run(self) {
        debug!("Watchdog started for {} on {:?}", self.machine, self.devices);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(target) = self.target.upgrade() else {
                break;
            };
            if !target.is_up(&self.machine).await {
                break;
            }
            drop(target);

            let Some((device, pps)) = self.measure().await else {
                break;
            };

            let wait = if pps >= self.config.stop_pps {
                warn!("Stopping {}: {} pps on {}", self.machine, pps, self.devices[device]);
                if let Some(target) = self.target.upgrade() {
                    if let Err(e) = target.stop_for_traffic(&self.machine).await {
                        warn!("Failed to stop {}: {:#}", self.machine, e);
                    }
                }
                self.notify(device, pps, AlertLevel::Stop).await;
                break;
            } else if pps >= self.config.alert_pps {
                self.notify(device, pps, AlertLevel::Alert).await;
                self.config.alert_backoff
            } else {
                self.config.interval
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!("Watchdog for {} exited", self.machine);
    }
}
