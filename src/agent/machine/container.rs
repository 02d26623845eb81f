pub mod config;
pub mod runtime;

use std::{path::PathBuf, time::Duration};

use tracing::{info, warn};

use crate::{
    agent::{
        error::{AgentError, Result, StageContext},
        image::{Image, validate_name},
        machine::{
            MachineContext,
            container::{config::ContainerConfig, runtime::ContainerStatus},
            machine::{
                Backup, BackendKind, MachineDescriptor, MachineState, MachineStats, RuntimeHandle,
            },
            stats::{cpu_percent, total_ticks},
            sysprep,
        },
        net::device_name,
    },
    constants::{
        CHECKPOINT_DIR, CONTAINER_CONFIG_FILE, CONTAINER_STATS_SAMPLE_MS, MIGRATION_CHECKPOINT,
        ROOTFS_DIR,
    },
    utils::{archive, fs::copy_dir, fs::list_dir_names, time::now_secs},
};

pub struct ContainerMachine<'a> {
    ctx: &'a MachineContext,
    descriptor: &'a mut MachineDescriptor,
}

impl<'a> ContainerMachine<'a> {
    pub fn new(ctx: &'a MachineContext, descriptor: &'a mut MachineDescriptor) -> Self {
        Self { ctx, descriptor }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn dir(&self) -> PathBuf {
        self.ctx
            .machine_dir(BackendKind::Container, &self.descriptor.name)
    }

    fn rootfs(&self) -> PathBuf {
        self.dir().join(ROOTFS_DIR)
    }

    fn config_path(&self) -> PathBuf {
        self.dir().join(CONTAINER_CONFIG_FILE)
    }

    fn checkpoint_dir(&self, name: &str) -> PathBuf {
        self.dir().join(CHECKPOINT_DIR).join(name)
    }

    async fn require(&mut self, expected: MachineState) -> Result<()> {
        let actual = self.state().await?;
        if actual != expected {
            return Err(AgentError::state_conflict(
                &self.descriptor.name,
                expected,
                actual,
            ));
        }
        Ok(())
    }

    async fn load_config(&self) -> Result<ContainerConfig> {
        ContainerConfig::load(&self.config_path())
            .await
            .stage("container config")
    }

    async fn save_config(&self, config: &ContainerConfig) -> Result<()> {
        config
            .save(&self.config_path())
            .await
            .stage("container config")
    }

    /// Points the configuration at this machine's own directory.
    fn rehome(&self, config: &mut ContainerConfig) {
        config.set(
            "lxc.rootfs.path",
            format!("dir:{}", self.rootfs().display()),
        );
        config.set("lxc.uts.name", self.descriptor.name.clone());
    }

    pub async fn create(&mut self, image: &Image) -> Result<()> {
        let dir = self.dir();
        let archive_path = self
            .ctx
            .migration_payload(BackendKind::Container, &self.descriptor.name);

        self.ctx
            .config
            .storage
            .provision(&dir)
            .await
            .stage("storage provision")?;

        if archive_path.exists() {
            info!("Creating {} from migration archive", self.name());
            archive::unpack(&archive_path, &dir)
                .await
                .stage("archive unpack")?;
            tokio::fs::remove_file(&archive_path)
                .await
                .stage("archive unpack")?;
        } else {
            self.ctx
                .runtime
                .instantiate(&self.descriptor.name, image.content_path()?)
                .await
                .stage("container create")?;
        }

        let mut config = self.load_config().await?;
        self.rehome(&mut config);
        config.set("lxc.console.path", "none");
        config.set("lxc.tty.max", "0");
        config.add("lxc.cgroup.devices.deny", "c 5:1 rwm");
        self.save_config(&config).await?;

        self.descriptor.runtime = RuntimeHandle::Container(self.descriptor.name.clone());
        Ok(())
    }

    pub async fn delete(&mut self) -> Result<()> {
        self.require(MachineState::Down).await?;

        if let Err(e) = self.ctx.runtime.destroy(self.name()).await {
            warn!("Container runtime could not destroy {}: {:#}", self.name(), e);
        }

        let dir = self.dir();
        self.ctx
            .config
            .storage
            .destroy(&dir)
            .await
            .stage("storage destroy")
    }

    /// Rewrites the network section from the current interface list.
    async fn write_network(&self) -> Result<()> {
        let mut config = self.load_config().await?;
        config.remove_prefix("lxc.net.");

        for (ordinal, iface) in self.descriptor.interfaces.iter().enumerate() {
            if !iface.is_bridge() {
                continue;
            }
            let Some(mac) = &iface.mac else {
                return Err(AgentError::validation(
                    "interface",
                    format!("interface {ordinal} has no MAC address"),
                ));
            };
            self.ctx.net.verify(iface).await?;

            let prefix = format!("lxc.net.{ordinal}");
            config.set(&format!("{prefix}.type"), "veth");
            config.set(&format!("{prefix}.flags"), "up");
            config.set(&format!("{prefix}.link"), self.ctx.net.bridge_name());
            config.set(&format!("{prefix}.hwaddr"), mac.clone());
            config.set(
                &format!("{prefix}.veth.pair"),
                device_name(self.descriptor.index, ordinal)?,
            );
        }

        self.save_config(&config).await
    }

    pub async fn start(&mut self) -> Result<()> {
        self.require(MachineState::Down).await?;
        self.write_network().await?;

        let checkpoint = self.checkpoint_dir(MIGRATION_CHECKPOINT);
        if checkpoint.exists() {
            info!("Resuming {} from its migration checkpoint", self.name());
            self.ctx
                .runtime
                .restore(self.name(), &checkpoint)
                .await
                .stage("container restore")?;

            if let Err(e) = tokio::fs::remove_dir_all(&checkpoint).await {
                warn!("Failed to delete consumed checkpoint of {}: {}", self.name(), e);
            }
        } else {
            self.ctx
                .runtime
                .start(self.name())
                .await
                .stage("container start")?;
        }

        self.descriptor.runtime = RuntimeHandle::Container(self.descriptor.name.clone());
        self.descriptor.state = MachineState::Up;
        info!("Started container {}", self.name());

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.require(MachineState::Up).await?;

        self.ctx
            .runtime
            .stop(self.name())
            .await
            .map_err(|e| AgentError::KillFailed(self.descriptor.name.clone(), format!("{e:#}")))?;

        self.descriptor.state = MachineState::Down;
        info!("Stopped container {}", self.name());
        Ok(())
    }

    pub async fn state(&mut self) -> Result<MachineState> {
        let status = self
            .ctx
            .runtime
            .status(self.name())
            .await
            .stage("container status")?;

        self.descriptor.state = match status {
            ContainerStatus::Running | ContainerStatus::Frozen => MachineState::Up,
            ContainerStatus::Stopped => MachineState::Down,
        };
        Ok(self.descriptor.state)
    }

    pub async fn stats(&mut self) -> Result<MachineStats> {
        self.require(MachineState::Up).await?;

        let runtime = &self.ctx.runtime;
        let name = self.descriptor.name.as_str();

        let cpu_before = runtime.cpu_ticks(name).await.stage("stats sample")?;
        let total_before = total_ticks().await.stage("stats sample")?;
        tokio::time::sleep(Duration::from_millis(CONTAINER_STATS_SAMPLE_MS)).await;
        let cpu_after = runtime.cpu_ticks(name).await.stage("stats sample")?;
        let total_after = total_ticks().await.stage("stats sample")?;

        let memory = runtime.memory_usage(name).await.stage("stats sample")?;

        Ok(MachineStats::new(
            cpu_percent(
                cpu_after.saturating_sub(cpu_before),
                total_after.saturating_sub(total_before),
            ),
            memory,
            self.descriptor.memory_mib,
        ))
    }

    pub async fn sysprep(&mut self, hostname: &str, password: &str) -> Result<()> {
        self.require(MachineState::Down).await?;
        let hash = sysprep::hash_password(&self.ctx.config.password_tool, password)
            .await
            .stage("password hash")?;

        let mut config = self.load_config().await?;
        config.set("lxc.uts.name", hostname);
        self.save_config(&config).await?;

        sysprep::apply(&self.rootfs(), hostname, &hash)
            .await
            .stage("sysprep")
    }

    pub async fn clone_storage(&mut self, new_name: &str) -> Result<()> {
        self.require(MachineState::Down).await?;

        let src = self.dir();
        let dst = self.ctx.machine_dir(BackendKind::Container, new_name);
        self.ctx
            .config
            .storage
            .clone(&src, &dst)
            .await
            .stage("storage clone")?;

        // the copy must not share checkpoints or network identity with its source
        let checkpoints = dst.join(CHECKPOINT_DIR);
        if checkpoints.exists() {
            tokio::fs::remove_dir_all(&checkpoints)
                .await
                .stage("storage clone")?;
        }

        let config_path = dst.join(CONTAINER_CONFIG_FILE);
        let mut config = ContainerConfig::load(&config_path)
            .await
            .stage("container config")?;
        config.set(
            "lxc.rootfs.path",
            format!("dir:{}", dst.join(ROOTFS_DIR).display()),
        );
        config.set("lxc.uts.name", new_name);
        config.remove_prefix("lxc.net.");
        config
            .save(&config_path)
            .await
            .stage("container config")
    }

    pub async fn list_checkpoints(&mut self) -> Result<Vec<String>> {
        list_dir_names(self.dir().join(CHECKPOINT_DIR))
            .await
            .stage("checkpoint list")
    }

    pub async fn has_checkpoint(&mut self, name: &str) -> Result<bool> {
        Ok(self.checkpoint_dir(name).is_dir())
    }

    pub async fn create_checkpoint(&mut self, name: &str) -> Result<()> {
        validate_name("checkpoint name", name)?;
        self.require(MachineState::Up).await?;

        let dir = self.checkpoint_dir(name);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .stage("checkpoint create")?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .stage("checkpoint create")?;

        self.ctx
            .runtime
            .freeze(self.name())
            .await
            .stage("container freeze")?;
        let written = self
            .ctx
            .runtime
            .checkpoint(self.name(), &dir)
            .await
            .stage("checkpoint create");
        let thawed = self
            .ctx
            .runtime
            .unfreeze(self.name())
            .await
            .stage("container unfreeze");

        written?;
        thawed?;

        info!("Created checkpoint {} of {}", name, self.name());
        Ok(())
    }

    pub async fn restore_checkpoint(&mut self, name: &str) -> Result<()> {
        if !self.has_checkpoint(name).await? {
            return Err(AgentError::not_found("checkpoint", name));
        }
        self.require(MachineState::Down).await?;
        self.write_network().await?;

        let dir = self.checkpoint_dir(name);
        self.ctx
            .runtime
            .restore(self.name(), &dir)
            .await
            .stage("container restore")?;

        self.descriptor.state = MachineState::Up;
        info!("Restored checkpoint {} of {}", name, self.name());
        Ok(())
    }

    pub async fn delete_checkpoint(&mut self, name: &str) -> Result<()> {
        let dir = self.checkpoint_dir(name);
        if !dir.is_dir() {
            return Err(AgentError::not_found("checkpoint", name));
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .stage("checkpoint delete")
    }

    pub async fn list_backups(&mut self) -> Result<Vec<Backup>> {
        let storage = &self.ctx.config.storage;

        let mut backups: Vec<Backup> = if storage.is_zfs() {
            storage
                .snapshot_list(&self.dir())
                .await
                .stage("backup list")?
                .iter()
                .filter_map(|s| s.parse().ok())
                .map(|timestamp| Backup { timestamp })
                .collect()
        } else {
            list_dir_names(self.dir())
                .await
                .stage("backup list")?
                .iter()
                .filter_map(|s| Backup::from_name(s))
                .collect()
        };

        backups.sort();
        Ok(backups)
    }

    async fn require_backup(&mut self, backup: Backup) -> Result<()> {
        if !self.list_backups().await?.contains(&backup) {
            return Err(AgentError::not_found("backup", backup.name()));
        }
        Ok(())
    }

    pub async fn create_backup(&mut self) -> Result<Backup> {
        self.require(MachineState::Down).await?;

        let backup = Backup {
            timestamp: now_secs(),
        };
        if self.list_backups().await?.contains(&backup) {
            return Err(AgentError::AlreadyExists {
                kind: "backup",
                name: backup.name(),
            });
        }

        let storage = &self.ctx.config.storage;
        if storage.is_zfs() {
            storage
                .snapshot_create(&self.dir(), &backup.timestamp.to_string())
                .await
                .stage("backup create")?;
        } else {
            copy_dir(self.rootfs(), self.dir().join(backup.name()))
                .await
                .stage("backup create")?;
        }

        Ok(backup)
    }

    pub async fn restore_backup(&mut self, backup: Backup) -> Result<()> {
        self.require(MachineState::Down).await?;
        self.require_backup(backup).await?;

        let storage = &self.ctx.config.storage;
        if storage.is_zfs() {
            return storage
                .snapshot_rollback(&self.dir(), &backup.timestamp.to_string())
                .await
                .stage("backup restore");
        }

        let rootfs = self.rootfs();
        if rootfs.exists() {
            tokio::fs::remove_dir_all(&rootfs)
                .await
                .stage("backup restore")?;
        }
        copy_dir(self.dir().join(backup.name()), rootfs)
            .await
            .stage("backup restore")
    }

    pub async fn delete_backup(&mut self, backup: Backup) -> Result<()> {
        self.require(MachineState::Down).await?;
        self.require_backup(backup).await?;

        let storage = &self.ctx.config.storage;
        if storage.is_zfs() {
            return storage
                .snapshot_destroy(&self.dir(), &backup.timestamp.to_string())
                .await
                .stage("backup delete");
        }

        tokio::fs::remove_dir_all(self.dir().join(backup.name()))
            .await
            .stage("backup delete")
    }
}
