use std::{fmt, path::Path, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{
    agent::{
        error::{AgentError, Result, StageContext},
        image::Image,
        machine::machine::{MachineDescriptor, MachineSpec},
    },
    utils::cmd,
};

/// Control-plane endpoint of a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Paths a peer expects migrated content under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub machine_path: String,
    pub migration_path: String,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn image(&self, name: &str) -> Result<Option<Image>>;

    async fn image_create(&self, image: &Image) -> Result<Image>;

    async fn config(&self) -> Result<RemoteConfig>;

    async fn machine_create(&self, spec: &MachineSpec) -> Result<MachineDescriptor>;

    async fn machine_start(&self, name: &str) -> Result<()>;
}

pub trait RemoteConnector: Send + Sync {
    fn connect(&self, remote: &Remote) -> Arc<dyn RemoteClient>;
}

/// Bulk copy of machine content to a peer.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn make_dirs(&self, host: &str, path: &Path) -> anyhow::Result<()>;

    async fn copy(&self, local: &Path, host: &str, remote_path: &Path) -> anyhow::Result<()>;
}

pub struct SshTransfer {
    user: Option<String>,
}

impl SshTransfer {
    pub fn new(user: Option<String>) -> Self {
        Self { user }
    }

    fn target(&self, host: &str) -> String {
        match &self.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }
}

#[async_trait]
impl Transfer for SshTransfer {
    async fn make_dirs(&self, host: &str, path: &Path) -> anyhow::Result<()> {
        let target = self.target(host);
        let path = path.to_string_lossy();
        cmd::run(
            "ssh",
            ["-o", "BatchMode=yes", target.as_str(), "mkdir", "-p", path.as_ref()],
        )
        .await?;
        Ok(())
    }

    async fn copy(&self, local: &Path, host: &str, remote_path: &Path) -> anyhow::Result<()> {
        let local = local.to_string_lossy();
        let destination = format!("{}:{}", self.target(host), remote_path.display());
        cmd::run(
            "scp",
            ["-o", "BatchMode=yes", "-q", local.as_ref(), destination.as_str()],
        )
        .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct HttpRemotes {
    client: Client,
}

impl RemoteConnector for HttpRemotes {
    fn connect(&self, remote: &Remote) -> Arc<dyn RemoteClient> {
        Arc::new(HttpRemote {
            client: self.client.clone(),
            base_url: format!("http://{}:{}", remote.host, remote.port),
        })
    }
}

struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Maps the peer's status codes onto the local taxonomy. `None` is a 404.
    async fn send(
        &self,
        request: RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> Result<Option<Response>> {
        let response = request.send().await.stage("remote request")?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::CONFLICT => Err(AgentError::AlreadyExists {
                kind,
                name: name.to_string(),
            }),
            status if status.is_success() => Ok(Some(response)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow!("request failed with status {}: {}", status, body))
                    .stage("remote request")
            }
        }
    }

    async fn require(
        &self,
        request: RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> Result<Response> {
        self.send(request, kind, name)
            .await?
            .ok_or_else(|| AgentError::not_found(kind, name))
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn image(&self, name: &str) -> Result<Option<Image>> {
        let request = self.client.get(self.url(&format!("/images/{name}")));
        match self.send(request, "image", name).await? {
            Some(response) => Ok(Some(response.json().await.stage("remote response")?)),
            None => Ok(None),
        }
    }

    async fn image_create(&self, image: &Image) -> Result<Image> {
        let request = self.client.post(self.url("/images")).json(image);
        self.require(request, "image", &image.name)
            .await?
            .json()
            .await
            .stage("remote response")
    }

    async fn config(&self) -> Result<RemoteConfig> {
        let request = self.client.get(self.url("/config"));
        self.require(request, "config", "node")
            .await?
            .json()
            .await
            .stage("remote response")
    }

    async fn machine_create(&self, spec: &MachineSpec) -> Result<MachineDescriptor> {
        let request = self.client.post(self.url("/machines")).json(spec);
        self.require(request, "machine", &spec.name)
            .await?
            .json()
            .await
            .stage("remote response")
    }

    async fn machine_start(&self, name: &str) -> Result<()> {
        let request = self.client.post(self.url(&format!("/machines/{name}/start")));
        self.require(request, "machine", name).await?;
        Ok(())
    }
}
