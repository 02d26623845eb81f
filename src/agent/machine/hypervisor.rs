pub mod monitor;
pub mod supervisor;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    agent::{
        error::{AgentError, Result, StageContext},
        image::{Image, validate_name},
        machine::{
            MachineContext,
            machine::{
                Backup, BackendKind, MachineDescriptor, MachineState, MachineStats, RuntimeHandle,
            },
            stats::sample_process,
            sysprep,
        },
    },
    constants::{
        CHECKPOINT_PREFIX, CONTROL_SOCKET_FILE, DISK_FILE, HYPERVISOR_STATS_SAMPLE_MS,
        MIGRATION_CHECKPOINT,
    },
    utils::{fs::move_file, time::now_secs},
};

/// One `-netdev`/`-device` pair per bridge interface, with its host TAP and MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapBinding {
    pub ordinal: usize,
    pub device: String,
    pub mac: String,
}

pub struct LaunchOptions<'a> {
    pub disk: &'a Path,
    pub socket: &'a Path,
    pub enable_kvm: bool,
    pub resume_from: Option<&'a str>,
    pub taps: &'a [TapBinding],
}

/// Hypervisor command line. The VNC display is the machine index, so two machines never share
/// one.
pub fn launch_args(descriptor: &MachineDescriptor, options: &LaunchOptions<'_>) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        descriptor.memory_mib.to_string(),
        "-smp".to_string(),
        descriptor.cores.to_string(),
        "-hda".to_string(),
        options.disk.display().to_string(),
        "-vnc".to_string(),
        format!(":{}", descriptor.index),
        "-qmp".to_string(),
        format!("unix:{},server,nowait", options.socket.display()),
    ];

    if options.enable_kvm {
        args.push("-enable-kvm".to_string());
    }

    if let Some(snapshot) = options.resume_from {
        args.push("-loadvm".to_string());
        args.push(snapshot.to_string());
    }

    if options.taps.is_empty() {
        args.push("-net".to_string());
        args.push("none".to_string());
    }

    for tap in options.taps {
        args.push("-netdev".to_string());
        args.push(format!(
            "tap,id=net{},ifname={},script=no,downscript=no",
            tap.ordinal, tap.device
        ));
        args.push("-device".to_string());
        args.push(format!("virtio-net-pci,netdev=net{},mac={}", tap.ordinal, tap.mac));
    }

    args
}

fn checkpoint_snapshot(name: &str) -> String {
    format!("{CHECKPOINT_PREFIX}{name}")
}

pub struct HypervisorMachine<'a> {
    ctx: &'a MachineContext,
    descriptor: &'a mut MachineDescriptor,
}

impl<'a> HypervisorMachine<'a> {
    pub fn new(ctx: &'a MachineContext, descriptor: &'a mut MachineDescriptor) -> Self {
        Self { ctx, descriptor }
    }

    fn dir(&self) -> PathBuf {
        self.ctx
            .machine_dir(BackendKind::Hypervisor, &self.descriptor.name)
    }

    fn disk(&self) -> PathBuf {
        self.dir().join(DISK_FILE)
    }

    fn socket(&self) -> PathBuf {
        self.dir().join(CONTROL_SOCKET_FILE)
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

    pub async fn create(&mut self, image: &Image) -> Result<()> {
        let dir = self.dir();
        let shipped = self
            .ctx
            .migration_payload(BackendKind::Hypervisor, &self.descriptor.name);

        self.ctx
            .config
            .storage
            .provision(&dir)
            .await
            .stage("storage provision")?;

        // a migrated disk keeps its data and snapshots; provisioning only rebases it
        if shipped.exists() {
            info!("Creating {} from migrated disk", self.descriptor.name);
            move_file(&shipped, &self.disk())
                .await
                .stage("disk adopt")?;
        }

        self.ctx
            .disk
            .provision(
                &self.disk(),
                image.content_path()?,
                self.descriptor.disk_bytes,
                image.main_partition,
            )
            .await
    }

    pub async fn delete(&mut self) -> Result<()> {
        self.require(MachineState::Down).await?;

        let dir = self.dir();
        self.ctx
            .config
            .storage
            .destroy(&dir)
            .await
            .stage("storage destroy")
    }

    async fn snapshots(&self) -> Result<Vec<String>> {
        self.ctx
            .disk
            .tool()
            .snapshots(&self.disk())
            .await
            .stage("snapshot list")
    }

    async fn release_taps(&self) {
        for (ordinal, iface) in self.descriptor.interfaces.iter().enumerate() {
            if iface.is_bridge() {
                self.ctx.net.tap_release(self.descriptor.index, ordinal).await;
            }
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.require(MachineState::Down).await?;

        let migration_snapshot = checkpoint_snapshot(MIGRATION_CHECKPOINT);
        let resume = self.snapshots().await?.contains(&migration_snapshot);

        // persistent TAPs outlive a failed launch unless handed back
        let process = match self.launch(resume.then_some(migration_snapshot.as_str())).await {
            Ok(process) => process,
            Err(e) => {
                self.release_taps().await;
                return Err(e);
            }
        };

        self.descriptor.runtime = RuntimeHandle::Pid(process.pid);
        self.descriptor.state = MachineState::Up;
        info!("Started {} with pid {}", self.descriptor.name, process.pid);

        if resume {
            if let Err(e) = self.delete_live_snapshot(&migration_snapshot).await {
                warn!(
                    "Failed to delete consumed checkpoint of {}: {}",
                    self.descriptor.name, e
                );
            }
        }

        Ok(())
    }

    /// Brings up the TAPs and spawns the process, which must survive the grace period.
    async fn launch(&self, resume_from: Option<&str>) -> Result<supervisor::Supervised> {
        let mut taps = Vec::new();
        for (ordinal, iface) in self.descriptor.interfaces.iter().enumerate() {
            if !iface.is_bridge() {
                continue;
            }
            let Some(mac) = iface.mac.clone() else {
                return Err(AgentError::validation(
                    "interface",
                    format!("interface {ordinal} has no MAC address"),
                ));
            };

            let device = self.ctx.net.tap_up(self.descriptor.index, ordinal).await?;
            self.ctx.net.verify(iface).await?;
            taps.push(TapBinding {
                ordinal,
                device,
                mac,
            });
        }

        let socket = self.socket();
        if socket.exists() {
            tokio::fs::remove_file(&socket)
                .await
                .stage("control socket")?;
        }

        let disk = self.disk();
        let args = launch_args(
            &*self.descriptor,
            &LaunchOptions {
                disk: &disk,
                socket: &socket,
                enable_kvm: self.ctx.config.enable_kvm,
                resume_from,
                taps: &taps,
            },
        );

        let process = supervisor::spawn(
            &self.descriptor.name,
            &self.ctx.config.hypervisor_binary,
            &args,
        )
        .stage("process spawn")?;

        tokio::time::sleep(self.ctx.config.start_grace).await;
        if process.has_exited() || !supervisor::is_alive(process.pid) {
            return Err(AgentError::StartFailed(self.descriptor.name.clone()));
        }

        Ok(process)
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.require(MachineState::Up).await?;

        self.release_taps().await;

        let pid = self.descriptor.pid().unwrap_or_default();
        supervisor::terminate(pid)
            .map_err(|e| AgentError::KillFailed(self.descriptor.name.clone(), format!("{e:#}")))?;

        self.descriptor.runtime = RuntimeHandle::None;
        self.descriptor.state = MachineState::Down;
        info!("Stopped {}", self.descriptor.name);

        Ok(())
    }

    pub async fn state(&mut self) -> Result<MachineState> {
        let alive = self.descriptor.pid().is_some_and(supervisor::is_alive);
        if alive {
            self.descriptor.state = MachineState::Up;
        } else {
            self.descriptor.runtime = RuntimeHandle::None;
            self.descriptor.state = MachineState::Down;
        }

        Ok(self.descriptor.state)
    }

    pub async fn stats(&mut self) -> Result<MachineStats> {
        self.require(MachineState::Up).await?;

        let pid = self.descriptor.pid().unwrap_or_default();
        let (cpu, rss) = sample_process(pid, Duration::from_millis(HYPERVISOR_STATS_SAMPLE_MS))
            .await
            .stage("stats sample")?;

        Ok(MachineStats::new(cpu, rss, self.descriptor.memory_mib))
    }

    pub async fn sysprep(&mut self, partition: u32, hostname: &str, password: &str) -> Result<()> {
        self.require(MachineState::Down).await?;

        let hash = sysprep::hash_password(&self.ctx.config.password_tool, password)
            .await
            .stage("password hash")?;
        // kept past the TempDir: it is only ever removed empty
        let mountpoint = tempfile::Builder::new()
            .prefix("kiln-sysprep-")
            .tempdir()
            .stage("sysprep mount")?
            .keep();

        let attachment = match self
            .ctx
            .disk
            .mount(&self.disk(), partition, &mountpoint)
            .await
        {
            Ok(attachment) => attachment,
            Err(e) => {
                sysprep::remove_mountpoint(&mountpoint).await;
                return Err(e);
            }
        };
        let applied = sysprep::apply(&mountpoint, hostname, &hash)
            .await
            .stage("sysprep");
        attachment.release().await?;
        sysprep::remove_mountpoint(&mountpoint).await;

        applied
    }

    pub async fn clone_storage(&mut self, new_name: &str) -> Result<()> {
        self.require(MachineState::Down).await?;

        let src = self.dir();
        let dst = self.ctx.machine_dir(BackendKind::Hypervisor, new_name);
        self.ctx
            .config
            .storage
            .clone(&src, &dst)
            .await
            .stage("storage clone")?;

        let socket = dst.join(CONTROL_SOCKET_FILE);
        if socket.exists() {
            tokio::fs::remove_file(&socket)
                .await
                .stage("storage clone")?;
        }
        Ok(())
    }

    pub async fn list_checkpoints(&mut self) -> Result<Vec<String>> {
        Ok(self
            .snapshots()
            .await?
            .iter()
            .filter_map(|s| s.strip_prefix(CHECKPOINT_PREFIX))
            .map(str::to_string)
            .collect())
    }

    pub async fn has_checkpoint(&mut self, name: &str) -> Result<bool> {
        Ok(self.snapshots().await?.contains(&checkpoint_snapshot(name)))
    }

    async fn require_checkpoint(&mut self, name: &str) -> Result<()> {
        if !self.has_checkpoint(name).await? {
            return Err(AgentError::not_found("checkpoint", name));
        }
        Ok(())
    }

    pub async fn create_checkpoint(&mut self, name: &str) -> Result<()> {
        validate_name("checkpoint name", name)?;
        self.require(MachineState::Up).await?;

        let mut session = self
            .ctx
            .control
            .open(&self.socket())
            .await
            .stage("control connect")?;
        monitor::pause(session.as_mut())
            .await
            .stage("checkpoint pause")?;
        // the guest resumes whether or not the save went through
        let saved = monitor::save_state(session.as_mut(), &checkpoint_snapshot(name))
            .await
            .stage("checkpoint save");
        let resumed = monitor::resume(session.as_mut())
            .await
            .stage("checkpoint resume");
        saved?;
        resumed?;

        info!("Created checkpoint {} of {}", name, self.descriptor.name);
        Ok(())
    }

    pub async fn restore_checkpoint(&mut self, name: &str) -> Result<()> {
        self.require_checkpoint(name).await?;

        if self.state().await? == MachineState::Down {
            self.start().await?;
            // a fresh start already resumed from the migration checkpoint
            if name == MIGRATION_CHECKPOINT {
                return Ok(());
            }
        }

        let mut session = self
            .ctx
            .control
            .open(&self.socket())
            .await
            .stage("control connect")?;
        monitor::pause(session.as_mut())
            .await
            .stage("checkpoint pause")?;
        let loaded = monitor::load_state(session.as_mut(), &checkpoint_snapshot(name))
            .await
            .stage("checkpoint load");
        let resumed = monitor::resume(session.as_mut())
            .await
            .stage("checkpoint resume");
        loaded?;
        resumed?;

        info!("Restored checkpoint {} of {}", name, self.descriptor.name);
        Ok(())
    }

    /// While the process runs it holds the disk; snapshots go through the control socket.
    async fn delete_live_snapshot(&self, snapshot: &str) -> Result<()> {
        let mut session = self
            .ctx
            .control
            .open(&self.socket())
            .await
            .stage("control connect")?;
        monitor::delete_state(session.as_mut(), snapshot)
            .await
            .stage("checkpoint delete")
    }

    pub async fn delete_checkpoint(&mut self, name: &str) -> Result<()> {
        self.require_checkpoint(name).await?;

        let snapshot = checkpoint_snapshot(name);
        match self.state().await? {
            MachineState::Up => self.delete_live_snapshot(&snapshot).await,
            MachineState::Down => self
                .ctx
                .disk
                .tool()
                .snapshot_delete(&self.disk(), &snapshot)
                .await
                .stage("checkpoint delete"),
        }
    }

    pub async fn list_backups(&mut self) -> Result<Vec<Backup>> {
        let mut backups: Vec<Backup> = self
            .snapshots()
            .await?
            .iter()
            .filter_map(|s| Backup::from_name(s))
            .collect();
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

        self.ctx
            .disk
            .tool()
            .snapshot_create(&self.disk(), &backup.name())
            .await
            .stage("backup create")?;

        Ok(backup)
    }

    pub async fn restore_backup(&mut self, backup: Backup) -> Result<()> {
        self.require(MachineState::Down).await?;
        self.require_backup(backup).await?;

        self.ctx
            .disk
            .tool()
            .snapshot_apply(&self.disk(), &backup.name())
            .await
            .stage("backup restore")
    }

    pub async fn delete_backup(&mut self, backup: Backup) -> Result<()> {
        self.require(MachineState::Down).await?;
        self.require_backup(backup).await?;

        self.ctx
            .disk
            .tool()
            .snapshot_delete(&self.disk(), &backup.name())
            .await
            .stage("backup delete")
    }
}
