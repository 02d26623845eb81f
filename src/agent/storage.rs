use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::{cmd, fs::copy_dir};

/// Where machine directories live: plain directories, or one ZFS dataset per machine mounted
/// at the machine directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StorageBackend {
    #[default]
    Dir,
    Zfs {
        pool: String,
    },
}

impl StorageBackend {
    /// Dataset backing a machine directory: `<pool>/<kind>/<name>`.
    fn dataset(pool: &str, path: &Path) -> Result<String> {
        let (Some(name), Some(kind)) = (
            path.file_name(),
            path.parent().and_then(Path::file_name),
        ) else {
            bail!("no dataset for {}", path.display());
        };

        Ok(format!(
            "{}/{}/{}",
            pool,
            kind.to_string_lossy(),
            name.to_string_lossy()
        ))
    }

    pub fn is_zfs(&self) -> bool {
        matches!(self, StorageBackend::Zfs { .. })
    }

    pub async fn provision(&self, path: &Path) -> Result<()> {
        match self {
            StorageBackend::Dir => {
                tokio::fs::create_dir_all(path).await?;
            }
            StorageBackend::Zfs { pool } => {
                let dataset = Self::dataset(pool, path)?;
                let mountpoint = format!("mountpoint={}", path.display());
                cmd::run("zfs", ["create", "-p", "-o", mountpoint.as_str(), dataset.as_str()])
                    .await?;
            }
        }

        Ok(())
    }

    pub async fn destroy(&self, path: &Path) -> Result<()> {
        match self {
            StorageBackend::Dir => {
                if path.exists() {
                    tokio::fs::remove_dir_all(path).await?;
                }
            }
            StorageBackend::Zfs { pool } => {
                let dataset = Self::dataset(pool, path)?;
                cmd::run("zfs", ["destroy", "-r", dataset.as_str()]).await?;
            }
        }

        Ok(())
    }

    /// Duplicates the storage at `src` into `dst`.
    pub async fn clone(&self, src: &Path, dst: &Path) -> Result<()> {
        if dst.exists() {
            bail!("{} already exists", dst.display());
        }

        match self {
            StorageBackend::Dir => copy_dir(src, dst).await?,
            StorageBackend::Zfs { pool } => {
                let source = Self::dataset(pool, src)?;
                let target = Self::dataset(pool, dst)?;
                let snapshot = format!("{}@clone-{}", source, crate::utils::time::now_secs());
                let mountpoint = format!("mountpoint={}", dst.display());

                cmd::run("zfs", ["snapshot", snapshot.as_str()]).await?;
                cmd::run(
                    "zfs",
                    [
                        "clone",
                        "-o",
                        mountpoint.as_str(),
                        snapshot.as_str(),
                        target.as_str(),
                    ],
                )
                .await?;
            }
        }

        info!("Cloned storage {} into {}", src.display(), dst.display());
        Ok(())
    }

    pub async fn snapshot_create(&self, path: &Path, name: &str) -> Result<()> {
        let snapshot = self.snapshot_name(path, name)?;
        cmd::run("zfs", ["snapshot", snapshot.as_str()]).await?;
        Ok(())
    }

    /// Snapshot names (the part after `@`) of the dataset at `path`.
    pub async fn snapshot_list(&self, path: &Path) -> Result<Vec<String>> {
        let StorageBackend::Zfs { pool } = self else {
            bail!("snapshots require zfs storage");
        };
        let dataset = Self::dataset(pool, path)?;

        let raw = cmd::run(
            "zfs",
            ["list", "-t", "snapshot", "-H", "-o", "name", "-r", dataset.as_str()],
        )
        .await?;

        Ok(parse_snapshot_list(&raw, &dataset))
    }

    pub async fn snapshot_rollback(&self, path: &Path, name: &str) -> Result<()> {
        let snapshot = self.snapshot_name(path, name)?;
        cmd::run("zfs", ["rollback", "-r", snapshot.as_str()]).await?;
        Ok(())
    }

    pub async fn snapshot_destroy(&self, path: &Path, name: &str) -> Result<()> {
        let snapshot = self.snapshot_name(path, name)?;
        cmd::run("zfs", ["destroy", snapshot.as_str()]).await?;
        Ok(())
    }

    fn snapshot_name(&self, path: &Path, name: &str) -> Result<String> {
        let StorageBackend::Zfs { pool } = self else {
            bail!("snapshots require zfs storage");
        };
        Ok(format!("{}@{}", Self::dataset(pool, path)?, name))
    }
}

fn parse_snapshot_list(raw: &str, dataset: &str) -> Vec<String> {
    raw.lines()
        .filter_map(|line| line.trim().split_once('@'))
        .filter(|(owner, _)| *owner == dataset)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Machine directory layout: `<root>/<kind>/<name>`.
pub fn machine_dir(root: &Path, kind_dir: &str, name: &str) -> PathBuf {
    root.join(kind_dir).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_names() {
        let path = Path::new("/var/lib/kiln/machines/lxc/web");
        assert_eq!(
            StorageBackend::dataset("tank", path).unwrap(),
            "tank/lxc/web"
        );
    }

    #[test]
    fn test_parse_snapshot_list_ignores_children() {
        let raw = "tank/lxc/web@1700000000\ntank/lxc/web@1700000100\ntank/lxc/web/child@1\n";
        assert_eq!(
            parse_snapshot_list(raw, "tank/lxc/web"),
            vec!["1700000000", "1700000100"]
        );
    }

    #[tokio::test]
    async fn test_dir_backend_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageBackend::Dir;

        let src = machine_dir(dir.path(), "qemu", "vm1");
        storage.provision(&src).await.unwrap();
        std::fs::write(src.join("disk.qcow2"), b"data").unwrap();

        let dst = machine_dir(dir.path(), "qemu", "vm2");
        storage.clone(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read(dst.join("disk.qcow2")).unwrap(), b"data");
        assert!(storage.clone(&src, &dst).await.is_err());

        storage.destroy(&src).await.unwrap();
        assert!(!src.exists());
        storage.destroy(&src).await.unwrap();

        assert!(storage.snapshot_list(&dst).await.is_err());
    }
}
