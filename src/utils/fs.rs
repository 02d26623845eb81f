use std::{os::unix::fs::symlink, path::Path};

use anyhow::{Context, Result};

/// Recursively copies `src` into `dst`, recreating symlinks instead of following them.
pub fn copy_dir_recursive(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    std::fs::create_dir_all(dst)
        .with_context(|| format!("failed to create {}", dst.display()))?;
    let permissions = std::fs::metadata(src)?.permissions();
    std::fs::set_permissions(dst, permissions)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        let file_type = std::fs::symlink_metadata(&path)?.file_type();

        if file_type.is_symlink() {
            let link = std::fs::read_link(&path)?;
            symlink(&link, &target)
                .with_context(|| format!("failed to link {}", target.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else if file_type.is_file() {
            std::fs::copy(&path, &target)
                .with_context(|| format!("failed to copy {}", path.display()))?;
        }
    }

    Ok(())
}

/// Renames `src` to `dst`, copying when they sit on different filesystems.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    match tokio::fs::rename(src, dst).await {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to move {}", src.display()));
        }
    }

    let partial = dst.with_extension("partial");
    tokio::fs::copy(src, &partial)
        .await
        .with_context(|| format!("failed to copy {}", src.display()))?;
    tokio::fs::rename(&partial, dst).await?;
    tokio::fs::remove_file(src).await?;
    Ok(())
}

pub async fn copy_dir(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref().to_path_buf();
    let dst = dst.as_ref().to_path_buf();

    tokio::task::spawn_blocking(move || copy_dir_recursive(src, dst)).await??;
    Ok(())
}

/// Lists the names of the direct sub-directories of `dir`, or nothing if it does not exist.
pub async fn list_dir_names(dir: impl AsRef<Path>) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();

    Ok(names)
}
