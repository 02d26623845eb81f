use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    process::Command,
    sync::{Mutex, OwnedMutexGuard},
};
use tracing::{info, warn};

use crate::{
    agent::error::{Result, StageContext},
    utils::cmd,
};

/// Copy-on-write disk image tooling.
#[async_trait]
pub trait DiskTool: Send + Sync {
    async fn create_overlay(&self, disk: &Path, backing: &Path) -> anyhow::Result<()>;

    /// Points an existing overlay at `backing` without touching its data.
    async fn rebase(&self, disk: &Path, backing: &Path) -> anyhow::Result<()>;

    async fn virtual_size(&self, disk: &Path) -> anyhow::Result<u64>;

    async fn resize(&self, disk: &Path, bytes: u64) -> anyhow::Result<()>;

    async fn snapshots(&self, disk: &Path) -> anyhow::Result<Vec<String>>;

    async fn snapshot_create(&self, disk: &Path, name: &str) -> anyhow::Result<()>;

    async fn snapshot_apply(&self, disk: &Path, name: &str) -> anyhow::Result<()>;

    async fn snapshot_delete(&self, disk: &Path, name: &str) -> anyhow::Result<()>;
}

/// Host block-device plumbing used to reach a disk's partitions.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Exposes `disk` as a block device and returns the device path.
    async fn attach(&self, disk: &Path) -> anyhow::Result<String>;

    async fn detach(&self, device: &str) -> anyhow::Result<()>;

    /// Extends `partition` to the end of the device and grows its filesystem.
    async fn grow_partition(&self, device: &str, partition: u32) -> anyhow::Result<()>;

    async fn mount(&self, device: &str, partition: u32, mountpoint: &Path) -> anyhow::Result<()>;

    async fn unmount(&self, mountpoint: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct QemuImgSnapshot {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct QemuImgInfo {
    virtual_size: u64,
    format: String,
    #[serde(default)]
    snapshots: Vec<QemuImgSnapshot>,
}

fn parse_info(raw: &str) -> anyhow::Result<QemuImgInfo> {
    serde_json::from_str(raw).with_context(|| format!("failed to parse qemu-img info: {raw}"))
}

pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn info(&self, disk: &Path) -> anyhow::Result<QemuImgInfo> {
        // -U: the disk may be held open by a running machine
        let raw = cmd::run(
            &self.binary,
            [
                OsStr::new("info"),
                OsStr::new("--output=json"),
                OsStr::new("-U"),
                disk.as_os_str(),
            ],
        )
        .await?;

        parse_info(&raw)
    }

    /// Overlays must name their backing format; a raw base read as qcow2 is refused.
    async fn backing_format(&self, backing: &Path) -> anyhow::Result<String> {
        Ok(self.info(backing).await?.format)
    }

    async fn snapshot(&self, flag: &str, disk: &Path, name: &str) -> anyhow::Result<()> {
        cmd::run(
            &self.binary,
            [
                OsStr::new("snapshot"),
                OsStr::new(flag),
                OsStr::new(name),
                disk.as_os_str(),
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DiskTool for QemuImg {
    async fn create_overlay(&self, disk: &Path, backing: &Path) -> anyhow::Result<()> {
        let format = self.backing_format(backing).await?;
        cmd::run(
            &self.binary,
            [
                OsStr::new("create"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                OsStr::new("-F"),
                OsStr::new(&format),
                OsStr::new("-b"),
                backing.as_os_str(),
                disk.as_os_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn rebase(&self, disk: &Path, backing: &Path) -> anyhow::Result<()> {
        let format = self.backing_format(backing).await?;
        cmd::run(
            &self.binary,
            [
                OsStr::new("rebase"),
                OsStr::new("-u"),
                OsStr::new("-F"),
                OsStr::new(&format),
                OsStr::new("-b"),
                backing.as_os_str(),
                disk.as_os_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn virtual_size(&self, disk: &Path) -> anyhow::Result<u64> {
        Ok(self.info(disk).await?.virtual_size)
    }

    async fn resize(&self, disk: &Path, bytes: u64) -> anyhow::Result<()> {
        cmd::run(
            &self.binary,
            [
                OsStr::new("resize"),
                disk.as_os_str(),
                OsStr::new(&bytes.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn snapshots(&self, disk: &Path) -> anyhow::Result<Vec<String>> {
        let info = self.info(disk).await?;
        Ok(info.snapshots.into_iter().map(|s| s.name).collect())
    }

    async fn snapshot_create(&self, disk: &Path, name: &str) -> anyhow::Result<()> {
        self.snapshot("-c", disk, name).await
    }

    async fn snapshot_apply(&self, disk: &Path, name: &str) -> anyhow::Result<()> {
        self.snapshot("-a", disk, name).await
    }

    async fn snapshot_delete(&self, disk: &Path, name: &str) -> anyhow::Result<()> {
        self.snapshot("-d", disk, name).await
    }
}

pub struct HostNbd {
    qemu_nbd: PathBuf,
    device: String,
}

impl HostNbd {
    pub fn new(qemu_nbd: impl Into<PathBuf>, device: impl Into<String>) -> Self {
        Self {
            qemu_nbd: qemu_nbd.into(),
            device: device.into(),
        }
    }

    fn partition_path(device: &str, partition: u32) -> String {
        format!("{device}p{partition}")
    }
}

#[async_trait]
impl BlockDevice for HostNbd {
    async fn attach(&self, disk: &Path) -> anyhow::Result<String> {
        cmd::run(
            &self.qemu_nbd,
            [OsStr::new("-c"), OsStr::new(&self.device), disk.as_os_str()],
        )
        .await?;

        // the partition table is not always picked up right away
        if let Err(e) = cmd::run("partx", ["-u", self.device.as_str()]).await {
            warn!("partx on {} failed: {:#}", self.device, e);
        }

        Ok(self.device.clone())
    }

    async fn detach(&self, device: &str) -> anyhow::Result<()> {
        cmd::run(&self.qemu_nbd, ["-d", device]).await?;
        Ok(())
    }

    async fn grow_partition(&self, device: &str, partition: u32) -> anyhow::Result<()> {
        let number = partition.to_string();
        cmd::run("parted", ["-s", device, "resizepart", number.as_str(), "100%"]).await?;

        let part = Self::partition_path(device, partition);

        // e2fsck exits 1 when it fixed something
        let status = Command::new("e2fsck")
            .args(["-f", "-y", part.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("failed to execute e2fsck")?;
        if !matches!(status.code(), Some(0) | Some(1)) {
            bail!("e2fsck on {part} failed ({status})");
        }

        cmd::run("resize2fs", [part.as_str()]).await?;
        Ok(())
    }

    async fn mount(&self, device: &str, partition: u32, mountpoint: &Path) -> anyhow::Result<()> {
        let part = Self::partition_path(device, partition);
        cmd::run("mount", [OsStr::new(&part), mountpoint.as_os_str()]).await?;
        Ok(())
    }

    async fn unmount(&self, mountpoint: &Path) -> anyhow::Result<()> {
        cmd::run("umount", [mountpoint]).await?;
        Ok(())
    }
}

/// A disk exposed through the node's block-device slot. The slot stays locked until the
/// attachment is released; dropping it without [`Attachment::release`] still detaches, in the
/// background.
pub struct Attachment {
    block: Arc<dyn BlockDevice>,
    device: String,
    mountpoint: Option<PathBuf>,
    slot: Option<OwnedMutexGuard<()>>,
}

impl Attachment {
    pub fn device(&self) -> &str {
        &self.device
    }

    async fn teardown(
        block: Arc<dyn BlockDevice>,
        device: String,
        mountpoint: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        let unmounted = match &mountpoint {
            Some(mountpoint) => block.unmount(mountpoint).await,
            None => Ok(()),
        };
        let detached = block.detach(&device).await;

        unmounted?;
        detached
    }

    pub async fn release(mut self) -> Result<()> {
        let slot = self.slot.take();
        let result = Self::teardown(
            self.block.clone(),
            self.device.clone(),
            self.mountpoint.take(),
        )
        .await;
        drop(slot);

        result.stage("block detach")
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        let block = self.block.clone();
        let device = std::mem::take(&mut self.device);
        let mountpoint = self.mountpoint.take();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Attachment of {} dropped outside a runtime, not detached", device);
            return;
        };

        handle.spawn(async move {
            if let Err(e) = Attachment::teardown(block, device.clone(), mountpoint).await {
                warn!("Failed to detach {}: {:#}", device, e);
            }
            drop(slot);
        });
    }
}

pub struct DiskAgent {
    tool: Arc<dyn DiskTool>,
    block: Arc<dyn BlockDevice>,
    slot: Arc<Mutex<()>>,
}

impl DiskAgent {
    pub fn new(tool: Arc<dyn DiskTool>, block: Arc<dyn BlockDevice>) -> Self {
        Self {
            tool,
            block,
            slot: Arc::new(Mutex::new(())),
        }
    }

    pub fn tool(&self) -> &Arc<dyn DiskTool> {
        &self.tool
    }

    /// Takes the single block-device slot and attaches `disk` to it.
    pub async fn attach(&self, disk: &Path) -> Result<Attachment> {
        let slot = self.slot.clone().lock_owned().await;
        let device = self.block.attach(disk).await.stage("block attach")?;

        Ok(Attachment {
            block: self.block.clone(),
            device,
            mountpoint: None,
            slot: Some(slot),
        })
    }

    /// Attaches `disk` and mounts `partition` on `mountpoint`.
    pub async fn mount(&self, disk: &Path, partition: u32, mountpoint: &Path) -> Result<Attachment> {
        let mut attachment = self.attach(disk).await?;

        if let Err(e) = self
            .block
            .mount(attachment.device(), partition, mountpoint)
            .await
        {
            attachment.release().await?;
            return Err(e).stage("partition mount");
        }

        attachment.mountpoint = Some(mountpoint.to_path_buf());
        Ok(attachment)
    }

    /// Derives `disk` from `backing` and grows it to `requested` bytes when that exceeds the
    /// backing image's size. A disk already on disk (shipped by a migration) is rebased instead
    /// of recreated.
    pub async fn provision(
        &self,
        disk: &Path,
        backing: &Path,
        requested: u64,
        partition: u32,
    ) -> Result<()> {
        if disk.exists() {
            info!("Rebasing existing disk {} on {}", disk.display(), backing.display());
            self.tool.rebase(disk, backing).await.stage("disk rebase")?;
        } else {
            self.tool
                .create_overlay(disk, backing)
                .await
                .stage("disk create")?;
        }

        let native = self
            .tool
            .virtual_size(backing)
            .await
            .stage("disk inspect")?;
        if requested <= native {
            return Ok(());
        }

        info!("Growing disk {} from {} to {} bytes", disk.display(), native, requested);
        self.tool
            .resize(disk, requested)
            .await
            .stage("disk resize")?;

        let attachment = self.attach(disk).await?;
        let grown = self
            .block
            .grow_partition(attachment.device(), partition)
            .await
            .stage("partition resize");
        attachment.release().await?;

        grown
    }
}
