pub mod fetch;

use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::{
    agent::{
        error::{AgentError, Result, StageContext},
        image::fetch::{FetchOptions, fetch},
        machine::machine::BackendKind,
    },
    constants::ARCHIVE_EXTENSION,
    machinery::store::Store,
};

#[derive(Debug, Clone)]
pub struct ImageAgentConfig {
    pub base_path: String,
    pub ssh_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub kind: BackendKind,
    /// Source as supplied by the caller.
    pub source: String,
    /// Absolute path of the fetched content; set by [`ImageAgent::image_create`].
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub distro: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
    /// Partition grown when a machine asks for a bigger disk than the image has.
    #[serde(default = "default_main_partition")]
    pub main_partition: u32,
}

fn default_main_partition() -> u32 {
    1
}

impl Image {
    pub fn new(name: impl Into<String>, kind: BackendKind, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            source: source.into(),
            local_path: None,
            arch: None,
            distro: None,
            release: None,
            main_partition: default_main_partition(),
        }
    }

    pub fn content_path(&self) -> Result<&PathBuf> {
        self.local_path
            .as_ref()
            .ok_or_else(|| AgentError::not_found("image content", &self.name))
    }
}

/// Names end up in paths and store keys.
pub fn validate_name(field: &'static str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if !valid {
        return Err(AgentError::validation(
            field,
            format!("'{name}' must be 1-64 characters of [A-Za-z0-9._-]"),
        ));
    }
    Ok(())
}

fn accepts_scheme(kind: BackendKind, scheme: &str) -> bool {
    match scheme {
        "file" | "scp" | "http" => true,
        "https" => kind == BackendKind::Container,
        _ => false,
    }
}

pub struct ImageAgent {
    config: ImageAgentConfig,
    store: Arc<Store>,
    base_path: PathBuf,
}

impl ImageAgent {
    pub async fn new(config: ImageAgentConfig, store: Arc<Store>) -> anyhow::Result<Self> {
        let base_path = PathBuf::from(&config.base_path);
        for kind in [BackendKind::Hypervisor, BackendKind::Container] {
            tokio::fs::create_dir_all(base_path.join(kind.dir_name())).await?;
        }

        Ok(Self {
            config,
            store,
            base_path,
        })
    }

    /// Where the content of an image is fetched to.
    pub fn content_path(&self, kind: BackendKind, name: &str) -> PathBuf {
        let file = match kind {
            BackendKind::Hypervisor => format!("{name}.qcow2"),
            BackendKind::Container => format!("{name}.{ARCHIVE_EXTENSION}"),
        };
        self.base_path.join(kind.dir_name()).join(file)
    }

    pub fn image(&self, name: &str) -> Result<Option<Image>> {
        self.store.get(name).map_err(AgentError::Store)
    }

    pub fn image_info(&self, name: &str) -> Result<Image> {
        self.image(name)?
            .ok_or_else(|| AgentError::not_found("image", name))
    }

    pub fn image_list(&self) -> Result<Vec<Image>> {
        self.store.list().map_err(AgentError::Store)
    }

    pub async fn image_create(&self, mut image: Image) -> Result<Image> {
        validate_name("image name", &image.name)?;
        if self.image(&image.name)?.is_some() {
            return Err(AgentError::AlreadyExists {
                kind: "image",
                name: image.name,
            });
        }

        let source = Url::parse(&image.source)
            .map_err(|e| AgentError::validation("source", format!("{}: {e}", image.source)))?;
        if !accepts_scheme(image.kind, source.scheme()) {
            return Err(AgentError::UnsupportedScheme(source.scheme().to_string()));
        }

        let dest = self.content_path(image.kind, &image.name);
        let options = FetchOptions {
            ssh_user: self.config.ssh_user.as_deref(),
        };
        fetch(&source, &dest, &options).await.stage("image fetch")?;

        let local_path = tokio::fs::canonicalize(&dest).await.stage("image fetch")?;
        image.local_path = Some(local_path);

        self.store.put(&image).map_err(AgentError::Store)?;
        info!("Created {} image {} from {}", image.kind, image.name, image.source);

        Ok(image)
    }

    /// Removes the fetched content and the record. Machines already derived from the image keep
    /// whatever they copied or linked.
    pub async fn image_delete(&self, name: &str) -> Result<()> {
        let image = self.image_info(name)?;

        if let Some(path) = &image.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Content of image {} already gone: {}", name, path.display());
                }
                Err(e) => return Err(e).stage("image delete"),
            }
        }

        self.store
            .delete::<Image>(name)
            .map_err(AgentError::Store)?;
        info!("Deleted image {}", name);

        Ok(())
    }
}
