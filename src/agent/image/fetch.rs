use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::info;
use url::Url;

use crate::utils::cmd;

/// Remote user for `scp://` sources that do not name one.
pub struct FetchOptions<'a> {
    pub ssh_user: Option<&'a str>,
}

pub async fn fetch(source: &Url, dest: &Path, options: &FetchOptions<'_>) -> Result<()> {
    info!("Fetching {} into {}", source, dest.display());

    match source.scheme() {
        "file" => fetch_file(source, dest).await,
        "scp" => fetch_scp(source, dest, options).await,
        "http" | "https" => fetch_http(source, dest).await,
        scheme => bail!("cannot fetch {scheme} sources"),
    }
}

async fn fetch_file(source: &Url, dest: &Path) -> Result<()> {
    let Ok(path) = source.to_file_path() else {
        bail!("{source} is not a local path");
    };

    tokio::fs::copy(&path, dest)
        .await
        .with_context(|| format!("failed to copy {}", path.display()))?;
    Ok(())
}

fn scp_remote(source: &Url, options: &FetchOptions<'_>) -> Result<String> {
    let Some(host) = source.host_str() else {
        bail!("{source} has no host");
    };

    let user = match source.username() {
        "" => options.ssh_user,
        user => Some(user),
    };

    Ok(match user {
        Some(user) => format!("{user}@{host}:{}", source.path()),
        None => format!("{host}:{}", source.path()),
    })
}

async fn fetch_scp(source: &Url, dest: &Path, options: &FetchOptions<'_>) -> Result<()> {
    let remote = scp_remote(source, options)?;
    let port = source.port().unwrap_or(22).to_string();
    let dest = dest.to_string_lossy().to_string();

    cmd::run(
        "scp",
        [
            "-o",
            "BatchMode=yes",
            "-P",
            port.as_str(),
            remote.as_str(),
            dest.as_str(),
        ],
    )
    .await?;
    Ok(())
}

async fn fetch_http(source: &Url, dest: &Path) -> Result<()> {
    let partial = dest.with_extension("partial");

    let mut response = reqwest::get(source.clone())
        .await?
        .error_for_status()
        .with_context(|| format!("failed to download {source}"))?;

    let mut file = File::create(&partial).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, dest).await?;
    Ok(())
}
