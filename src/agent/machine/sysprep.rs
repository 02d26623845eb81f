use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::utils::cmd;

/// SHA-512 crypt hash, as expected in /etc/shadow. `tool` takes `openssl passwd` arguments.
pub async fn hash_password(tool: &str, password: &str) -> Result<String> {
    let hash = cmd::run_with_stdin(tool, ["passwd", "-6", "-stdin"], password.as_bytes()).await?;
    let hash = hash.trim();
    if hash.is_empty() {
        bail!("{tool} printed no password hash");
    }
    Ok(hash.to_string())
}

/// Drops an emptied mountpoint. Never recursive: a mountpoint that failed to unmount still
/// shows the guest filesystem.
pub async fn remove_mountpoint(mountpoint: &Path) {
    if let Err(e) = tokio::fs::remove_dir(mountpoint).await {
        warn!("Leaving mountpoint {} in place: {}", mountpoint.display(), e);
    }
}

/// Replaces the password field of the root entry.
pub fn rewrite_root_entry(shadow: &str, hash: &str) -> Result<String> {
    let mut found = false;
    let mut lines = Vec::new();

    for line in shadow.lines() {
        let mut fields: Vec<&str> = line.split(':').collect();
        if fields.first() == Some(&"root") && fields.len() > 1 {
            fields[1] = hash;
            found = true;
            lines.push(fields.join(":"));
        } else {
            lines.push(line.to_string());
        }
    }

    if !found {
        bail!("no root entry in shadow file");
    }

    let mut rewritten = lines.join("\n");
    rewritten.push('\n');
    Ok(rewritten)
}

/// Sets hostname and root password inside a guest root filesystem mounted at `root`.
pub async fn apply(root: &Path, hostname: &str, password_hash: &str) -> Result<()> {
    let etc = root.join("etc");
    tokio::fs::create_dir_all(&etc).await?;

    tokio::fs::write(etc.join("hostname"), format!("{hostname}\n"))
        .await
        .context("failed to write hostname")?;

    let shadow_path = etc.join("shadow");
    let shadow = tokio::fs::read_to_string(&shadow_path)
        .await
        .context("failed to read shadow file")?;
    let shadow = rewrite_root_entry(&shadow, password_hash)?;
    tokio::fs::write(&shadow_path, shadow)
        .await
        .context("failed to write shadow file")?;

    Ok(())
}
