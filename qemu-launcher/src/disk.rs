use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::command::DiskImage;

/// Size of a freshly created backing image.
pub const DEFAULT_IMAGE_SIZE: &str = "64M";

/// Creates every missing backing file under `dir` with `qemu-img`.
/// Existing images are never touched. Returns the paths that were created.
pub async fn ensure_images(disks: &[DiskImage], dir: &Path, qemu_img: &Path) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for disk in disks {
        let path = dir.join(disk.file_name());
        if tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("could not check {}", path.display()))?
        {
            continue;
        }
        tracing::info!(role = disk.role, image = %path.display(), size = DEFAULT_IMAGE_SIZE, "Creating disk image");
        let status = Command::new(qemu_img)
            .args(["create", "-f", "qcow2"])
            .arg(&path)
            .arg(DEFAULT_IMAGE_SIZE)
            .status()
            .await
            .with_context(|| format!("could not run {}", qemu_img.display()))?;
        if !status.success() {
            bail!("qemu-img failed with status {}", status);
        }
        created.push(path);
    }
    Ok(created)
}
