
/// Checkpoint name reserved for live migration; a destination resumes from it on start.
pub const MIGRATION_CHECKPOINT: &str = "migration";

pub const CHECKPOINT_PREFIX: &str = "checkpoint_";
pub const BACKUP_PREFIX: &str = "backup_";

pub const ANY_IP: &str = "0.0.0.0";
pub const MAC_PREFIX: [u8; 2] = [0x52, 0x54];

pub const DISK_FILE: &str = "disk.qcow2";
pub const CONTROL_SOCKET_FILE: &str = "qmp.sock";
pub const ROOTFS_DIR: &str = "rootfs";
pub const CHECKPOINT_DIR: &str = "checkpoint";
pub const CONTAINER_CONFIG_FILE: &str = "config";
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

pub const DEFAULT_START_GRACE_MS: u64 = 500;
pub const HYPERVISOR_STATS_SAMPLE_MS: u64 = 100;
pub const CONTAINER_STATS_SAMPLE_MS: u64 = 50;

pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_WATCHDOG_SAMPLE_SECS: u64 = 1;
pub const DEFAULT_WATCHDOG_ALERT_BACKOFF_SECS: u64 = 15 * 60;

pub const DEFAULT_NBD_DEVICE: &str = "/dev/nbd0";
pub const DEFAULT_TRAFFIC_CHAIN: &str = "KILN";
