use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Host platform quirks that change the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Host {
    /// QEMU runs as a Windows program, natively or from WSL.
    pub windows: bool,
}

impl Host {
    /// Inspects the resolved emulator binary. A Windows QEMU reached
    /// through a WSL symlink still counts.
    pub fn detect(qemu: &Path) -> Self {
        if cfg!(windows) {
            return Self { windows: true };
        }
        let resolved = std::fs::canonicalize(qemu).unwrap_or_else(|_| qemu.to_path_buf());
        let windows = match File::open(&resolved) {
            Ok(mut file) => {
                let mut magic = [0u8; 2];
                file.read_exact(&mut magic).is_ok() && is_pe_image(&magic)
            }
            Err(e) => {
                tracing::debug!(path = %resolved.display(), error = %e, "Could not inspect QEMU binary");
                false
            }
        };
        Self { windows }
    }
}

/// DOS/PE executables start with `MZ`.
pub fn is_pe_image(header: &[u8]) -> bool {
    header.starts_with(b"MZ")
}
