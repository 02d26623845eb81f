use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use flate2::{Compression, bufread::GzDecoder, write::GzEncoder};
use tar::{Archive, Builder};
use tracing::info;

fn pack_dir_blocking(src_dir: &Path, archive_path: &Path) -> Result<()> {
    let file = File::create(archive_path)
        .with_context(|| format!("failed to create {}", archive_path.display()))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src_dir)?;

    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;

    Ok(())
}

fn unpack_blocking(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));

    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    std::fs::create_dir_all(dest_dir)?;
    archive.unpack(dest_dir)?;

    Ok(())
}

/// Packs the contents of `src_dir` into a gzipped tarball at `archive_path`.
pub async fn pack_dir(src_dir: impl AsRef<Path>, archive_path: impl AsRef<Path>) -> Result<()> {
    let src_dir = src_dir.as_ref().to_owned();
    let archive_path = archive_path.as_ref().to_owned();

    info!(
        "Packing {} into {}",
        src_dir.display(),
        archive_path.display()
    );
    tokio::task::spawn_blocking(move || pack_dir_blocking(&src_dir, &archive_path)).await??;

    Ok(())
}

pub async fn unpack(archive_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<()> {
    let archive_path = archive_path.as_ref().to_owned();
    let dest_dir = dest_dir.as_ref().to_owned();

    info!(
        "Unpacking {} to {}",
        archive_path.display(),
        dest_dir.display()
    );
    tokio::task::spawn_blocking(move || unpack_blocking(&archive_path, &dest_dir)).await??;

    Ok(())
}
