use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use crate::utils::{archive, cmd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Frozen,
    Stopped,
}

/// Container runtime control, one container per machine name.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates the container and fills its root filesystem from the template archive.
    async fn instantiate(&self, name: &str, template: &Path) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    async fn destroy(&self, name: &str) -> Result<()>;

    async fn status(&self, name: &str) -> Result<ContainerStatus>;

    async fn freeze(&self, name: &str) -> Result<()>;

    async fn unfreeze(&self, name: &str) -> Result<()>;

    async fn checkpoint(&self, name: &str, dir: &Path) -> Result<()>;

    /// Resumes a stopped container from a checkpoint directory.
    async fn restore(&self, name: &str, dir: &Path) -> Result<()>;

    /// User plus system cpu time, in clock ticks.
    async fn cpu_ticks(&self, name: &str) -> Result<u64>;

    async fn memory_usage(&self, name: &str) -> Result<u64>;
}

pub fn parse_status(raw: &str) -> Result<ContainerStatus> {
    match raw.trim() {
        "RUNNING" | "STARTING" | "FREEZING" | "THAWED" => Ok(ContainerStatus::Running),
        "FROZEN" => Ok(ContainerStatus::Frozen),
        "STOPPED" | "STOPPING" | "ABORTING" => Ok(ContainerStatus::Stopped),
        other => bail!("unknown container state '{other}'"),
    }
}

/// `cpuacct.stat` content: "user N\nsystem M".
pub fn parse_cpuacct(raw: &str) -> Result<u64> {
    let mut total = 0;
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        if key == "user" || key == "system" {
            total += value.trim().parse::<u64>()?;
        }
    }
    Ok(total)
}

pub struct LxcRuntime {
    lxc_path: PathBuf,
}

impl LxcRuntime {
    pub fn new(lxc_path: impl Into<PathBuf>) -> Self {
        Self {
            lxc_path: lxc_path.into(),
        }
    }

    async fn lxc<I, S>(&self, tool: &str, name: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut full: Vec<std::ffi::OsString> = vec![
            "-n".into(),
            name.into(),
            "-P".into(),
            self.lxc_path.clone().into_os_string(),
        ];
        full.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));

        cmd::run(tool, full).await
    }
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    async fn instantiate(&self, name: &str, template: &Path) -> Result<()> {
        self.lxc("lxc-create", name, ["-t", "none"]).await?;

        let rootfs = self.lxc_path.join(name).join("rootfs");
        archive::unpack(template, &rootfs)
            .await
            .with_context(|| format!("failed to unpack template into {}", rootfs.display()))
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.lxc("lxc-start", name, ["-d"]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.lxc("lxc-stop", name, Vec::<&str>::new()).await?;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.lxc("lxc-destroy", name, ["-f"]).await?;
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ContainerStatus> {
        let raw = self.lxc("lxc-info", name, ["-s", "-H"]).await?;
        parse_status(&raw)
    }

    async fn freeze(&self, name: &str) -> Result<()> {
        self.lxc("lxc-freeze", name, Vec::<&str>::new()).await?;
        Ok(())
    }

    async fn unfreeze(&self, name: &str) -> Result<()> {
        self.lxc("lxc-unfreeze", name, Vec::<&str>::new()).await?;
        Ok(())
    }

    async fn checkpoint(&self, name: &str, dir: &Path) -> Result<()> {
        self.lxc("lxc-checkpoint", name, [OsStr::new("-D"), dir.as_os_str()])
            .await?;
        Ok(())
    }

    async fn restore(&self, name: &str, dir: &Path) -> Result<()> {
        self.lxc(
            "lxc-checkpoint",
            name,
            [OsStr::new("-r"), OsStr::new("-D"), dir.as_os_str(), OsStr::new("-d")],
        )
        .await?;
        Ok(())
    }

    async fn cpu_ticks(&self, name: &str) -> Result<u64> {
        let raw = self.lxc("lxc-cgroup", name, ["cpuacct.stat"]).await?;
        parse_cpuacct(&raw)
    }

    async fn memory_usage(&self, name: &str) -> Result<u64> {
        let raw = self
            .lxc("lxc-cgroup", name, ["memory.usage_in_bytes"])
            .await?;
        Ok(raw.trim().parse()?)
    }
}
