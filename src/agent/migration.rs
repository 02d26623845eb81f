pub mod remote;

use std::{fmt, path::Path, sync::Arc};

use tracing::{info, warn};

use crate::{
    agent::{
        error::{AgentError, Result, StageContext},
        image::{Image, ImageAgent},
        machine::{
            MachineAgent, migration_file,
            machine::{BackendKind, MachineDescriptor, MachineState},
        },
        migration::remote::{Remote, RemoteClient, RemoteConfig, RemoteConnector, Transfer},
    },
    constants::{DISK_FILE, MIGRATION_CHECKPOINT},
    utils::archive,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStage {
    Checkpoint,
    Stop,
    EnsureImage,
    Transfer,
    RemoteCreate,
    RemoteStart,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationStage::Checkpoint => "checkpoint",
            MigrationStage::Stop => "stop",
            MigrationStage::EnsureImage => "ensure-image",
            MigrationStage::Transfer => "transfer",
            MigrationStage::RemoteCreate => "remote-create",
            MigrationStage::RemoteStart => "remote-start",
        };
        write!(f, "{name}")
    }
}

trait AtStage<T> {
    fn at(self, stage: MigrationStage) -> Result<T>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: MigrationStage) -> Result<T> {
        self.map_err(|e| AgentError::Migration {
            stage,
            source: Box::new(e),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MigrationAgentConfig {
    /// Address peers reach this node's image content under (`scp://<advertise_host>/...`).
    pub advertise_host: String,
}

/// Moves machines to peer nodes. The source copy is never removed.
pub struct MigrationAgent {
    config: MigrationAgentConfig,
    machine: Arc<MachineAgent>,
    image: Arc<ImageAgent>,
    remotes: Arc<dyn RemoteConnector>,
    transfer: Arc<dyn Transfer>,
}

impl MigrationAgent {
    pub fn new(
        config: MigrationAgentConfig,
        machine: Arc<MachineAgent>,
        image: Arc<ImageAgent>,
        remotes: Arc<dyn RemoteConnector>,
        transfer: Arc<dyn Transfer>,
    ) -> Self {
        Self {
            config,
            machine,
            image,
            remotes,
            transfer,
        }
    }

    /// Cold migration: the machine is stopped if it runs and recreated, down, on `remote`.
    pub async fn migrate(&self, name: &str, remote: &Remote) -> Result<MachineDescriptor> {
        self.machine.machine_info(name)?;
        let client = self.remotes.connect(remote);

        info!("Migrating {} to {}", name, remote);
        let created = self.ship(name, remote, client.as_ref()).await?;
        info!("Migrated {} to {}", name, remote);

        Ok(created)
    }

    /// Live migration: checkpoint, ship, then resume from the checkpoint on `remote`.
    ///
    /// A machine that is already down but still holds the migration checkpoint (a previous
    /// attempt failed after stopping it) is shipped from that checkpoint.
    pub async fn migrate_live(&self, name: &str, remote: &Remote) -> Result<MachineDescriptor> {
        self.machine.machine_info(name)?;
        let client = self.remotes.connect(remote);

        info!("Live migrating {} to {}", name, remote);
        match self.machine.machine_state(name).await.at(MigrationStage::Checkpoint)? {
            MachineState::Up => {
                self.machine
                    .checkpoint_create(name, MIGRATION_CHECKPOINT)
                    .await
                    .at(MigrationStage::Checkpoint)?;
            }
            MachineState::Down => {
                let reusable = self
                    .machine
                    .checkpoint_exists(name, MIGRATION_CHECKPOINT)
                    .await
                    .at(MigrationStage::Checkpoint)?;
                if !reusable {
                    return Err(AgentError::state_conflict(
                        name,
                        MachineState::Up,
                        MachineState::Down,
                    ))
                    .at(MigrationStage::Checkpoint);
                }
                info!("Reusing migration checkpoint of {}", name);
            }
        }

        let mut created = self.ship(name, remote, client.as_ref()).await?;

        client
            .machine_start(name)
            .await
            .at(MigrationStage::RemoteStart)?;
        created.state = MachineState::Up;

        if let Err(e) = self
            .machine
            .checkpoint_delete(name, MIGRATION_CHECKPOINT)
            .await
        {
            warn!("Failed to delete migration checkpoint of {}: {}", name, e);
        }
        info!("Live migrated {} to {}", name, remote);

        Ok(created)
    }

    async fn ship(
        &self,
        name: &str,
        remote: &Remote,
        client: &dyn RemoteClient,
    ) -> Result<MachineDescriptor> {
        if self.machine.machine_state(name).await.at(MigrationStage::Stop)? == MachineState::Up {
            self.machine
                .machine_stop(name)
                .await
                .at(MigrationStage::Stop)?;
        }
        let descriptor = self.machine.machine_info(name)?;

        self.ensure_image(&descriptor, client)
            .await
            .at(MigrationStage::EnsureImage)?;

        let config = client.config().await.at(MigrationStage::Transfer)?;
        self.transfer_content(&descriptor, &remote.host, &config)
            .await
            .at(MigrationStage::Transfer)?;

        client
            .machine_create(&descriptor.spec())
            .await
            .at(MigrationStage::RemoteCreate)
    }

    /// Registers the machine's image on the peer unless it already has one by that name. The
    /// peer pulls the content from this node.
    async fn ensure_image(
        &self,
        descriptor: &MachineDescriptor,
        client: &dyn RemoteClient,
    ) -> Result<()> {
        if client.image(&descriptor.image).await?.is_some() {
            return Ok(());
        }

        let local = self.image.image_info(&descriptor.image)?;
        let source = format!(
            "scp://{}{}",
            self.config.advertise_host,
            local.content_path()?.display()
        );

        let image = Image {
            source,
            local_path: None,
            ..local
        };

        info!("Registering image {} on peer from {}", image.name, image.source);
        client.image_create(&image).await?;
        Ok(())
    }

    async fn transfer_content(
        &self,
        descriptor: &MachineDescriptor,
        host: &str,
        config: &RemoteConfig,
    ) -> Result<()> {
        let local_dir = self
            .machine
            .context()
            .machine_dir(descriptor.kind, &descriptor.name);
        let file = migration_file(descriptor.kind, &descriptor.name);
        // the peer moves the payload into freshly provisioned storage on create
        let remote_path = Path::new(&config.migration_path).join(&file);
        self.transfer
            .make_dirs(host, Path::new(&config.migration_path))
            .await
            .stage("remote mkdir")?;

        match descriptor.kind {
            BackendKind::Hypervisor => {
                self.transfer
                    .copy(&local_dir.join(DISK_FILE), host, &remote_path)
                    .await
                    .stage("disk copy")?;
            }
            BackendKind::Container => {
                let staging = tempfile::tempdir().stage("archive pack")?;
                let local_archive = staging.path().join(&file);
                archive::pack_dir(&local_dir, &local_archive)
                    .await
                    .stage("archive pack")?;
                self.transfer
                    .copy(&local_archive, host, &remote_path)
                    .await
                    .stage("archive copy")?;
            }
        }

        Ok(())
    }
}
