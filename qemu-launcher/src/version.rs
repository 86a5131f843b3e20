use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::process::Command;

/// First release with `virtio-sound-pci`.
pub const VIRTIO_SOUND_MIN: QemuVersion = QemuVersion::new(8, 2, 0);

/// First release with the `ufs` controller.
pub const UFS_MIN: QemuVersion = QemuVersion::new(8, 2, 0);

/// Emulator release, ordered numerically component by component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QemuVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    #[error("no `version` marker in banner {0:?}")]
    MissingMarker(String),
    #[error("malformed version {0:?}")]
    Malformed(String),
}

impl QemuVersion {
    pub const fn new(major: u32, minor: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            revision,
        }
    }

    /// Runs `<program> --version` and parses the first line of its output.
    pub async fn query(program: &Path) -> Result<Self> {
        let output = Command::new(program)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("could not run {} --version", program.display()))?;
        if !output.status.success() {
            bail!(
                "{} --version failed with status {}",
                program.display(),
                output.status
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next().unwrap_or_default();
        let version = Self::from_banner(first)?;
        tracing::debug!(%version, "Detected QEMU");
        Ok(version)
    }

    /// Parses a banner such as `QEMU emulator version 8.2.1 (Debian 1:8.2.1+dfsg-1)`.
    pub fn from_banner(banner: &str) -> Result<Self, VersionError> {
        const MARKER: &str = "version ";
        let start = banner
            .find(MARKER)
            .ok_or_else(|| VersionError::MissingMarker(banner.to_string()))?;
        let token = banner[start + MARKER.len()..]
            .split_whitespace()
            .next()
            .unwrap_or_default();
        token.parse()
    }
}

impl FromStr for QemuVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || VersionError::Malformed(s.to_string());
        let mut parts = s.trim().split('.').map(leading_number);
        let major = parts.next().flatten().ok_or_else(malformed)?;
        let minor = parts.next().flatten().ok_or_else(malformed)?;
        let revision = match parts.next() {
            Some(Some(revision)) => revision,
            Some(None) => return Err(malformed()),
            None => 0,
        };
        Ok(Self::new(major, minor, revision))
    }
}

// Release candidates and distro builds carry suffixes like `0-rc1` or `0+dfsg`.
fn leading_number(part: &str) -> Option<u32> {
    let end = part
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(part.len());
    part[..end].parse().ok()
}

impl fmt::Display for QemuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}
