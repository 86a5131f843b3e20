//! Device-tree compile wrapper for the qemu-virt64-aarch64 board.
//!
//! Sources go through the C preprocessor (so board `.dts` files can use
//! `#include` and the driver-framework macros) and are then compiled with
//! `dtc`. A binary whose modification time is not older than its source is
//! left alone.

use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Location of the bundled dtc sources, relative to the RT-Thread root.
pub const DTC_SUBDIR: &str = "tools/dtc";

/// Driver-framework headers used as the preprocessor include path.
pub const INCLUDE_SUBDIR: &str = "components/drivers/include";

/// Resolves the RT-Thread root: an explicit value wins, otherwise two
/// directories above the current one (the layout of `bsp/<board>`).
pub fn rtt_root(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(root) => Ok(root),
        None => {
            let cwd = std::env::current_dir().context("could not read current directory")?;
            Ok(cwd.join("..").join(".."))
        }
    }
}

/// Binary counterpart of a device-tree source.
pub fn dtb_path(dts: &Path) -> PathBuf {
    dts.with_extension("dtb")
}

/// Source counterpart of a device-tree binary.
pub fn dts_path(dtb: &Path) -> PathBuf {
    dtb.with_extension("dts")
}

/// Whether `binary` exists and is at least as new as `source`.
pub fn is_fresh(source: &Path, binary: &Path) -> Result<bool> {
    let binary_mtime = match std::fs::metadata(binary) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("could not stat {}", binary.display())),
    };
    let source_mtime = std::fs::metadata(source)
        .with_context(|| format!("could not stat {}", source.display()))?
        .modified()?;
    Ok(binary_mtime >= source_mtime)
}

/// What happened to a single source during [`Toolchain::compile_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Built,
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    pub source: PathBuf,
    pub binary: PathBuf,
    pub outcome: Outcome,
}

/// The external tools needed to turn `.dts` into `.dtb` and back.
#[derive(Debug, Clone)]
pub struct Toolchain {
    dtc: PathBuf,
    cpp: PathBuf,
    include_dirs: Vec<PathBuf>,
}

impl Toolchain {
    pub fn new(dtc: impl Into<PathBuf>) -> Self {
        Self {
            dtc: dtc.into(),
            cpp: PathBuf::from("cpp"),
            include_dirs: Vec::new(),
        }
    }

    /// Uses the `dtc` found on `PATH`.
    pub fn system() -> Result<Self> {
        let dtc = which::which("dtc").context("`dtc` not found in PATH")?;
        Ok(Self::new(dtc))
    }

    /// Builds the dtc shipped under `tools/dtc` with scons and uses it, with
    /// the driver-framework headers on the include path.
    pub async fn bundled(root: &Path) -> Result<Self> {
        let dir = root.join(DTC_SUBDIR);
        let scons = which::which("scons").context("`scons` not found in PATH")?;
        tracing::info!(dir = %dir.display(), "Building bundled dtc");
        run(Command::new(scons).arg("-C").arg(&dir), "scons").await?;
        Ok(Self::new(dir.join("dtc")).with_include(root.join(INCLUDE_SUBDIR)))
    }

    pub fn with_include(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn with_preprocessor(mut self, cpp: impl Into<PathBuf>) -> Self {
        self.cpp = cpp.into();
        self
    }

    pub fn dtc(&self) -> &Path {
        &self.dtc
    }

    pub fn include_dirs(&self) -> &[PathBuf] {
        &self.include_dirs
    }

    /// Compiles every stale source. Sources with a fresh binary are reported
    /// as [`Outcome::UpToDate`] without spawning anything.
    pub async fn compile_all<P: AsRef<Path>>(&self, sources: &[P]) -> Result<Vec<Compiled>> {
        let mut out = Vec::with_capacity(sources.len());
        for source in sources {
            out.push(self.compile(source.as_ref()).await?);
        }
        Ok(out)
    }

    pub async fn compile(&self, source: &Path) -> Result<Compiled> {
        let binary = dtb_path(source);
        if is_fresh(source, &binary)? {
            tracing::debug!(dtb = %binary.display(), "Device tree is up to date");
            return Ok(Compiled {
                source: source.to_path_buf(),
                binary,
                outcome: Outcome::UpToDate,
            });
        }

        let expanded = with_suffix(source, ".tmp");
        if let Err(e) = self.preprocess(source, &expanded).await {
            discard(&expanded).await?;
            return Err(e);
        }

        tracing::info!(dts = %source.display(), dtb = %binary.display(), "Compiling device tree");
        let compiled = run(
            Command::new(&self.dtc)
                .args(["-I", "dts", "-O", "dtb", "-@", "-A", "-o"])
                .arg(&binary)
                .arg(&expanded),
            "dtc",
        )
        .await;
        remove_file(&expanded).await?;
        compiled?;

        Ok(Compiled {
            source: source.to_path_buf(),
            binary,
            outcome: Outcome::Built,
        })
    }

    /// Turns a binary tree back into source form, keeping labels and
    /// phandle symbols so overlays can refer to them.
    pub async fn decompile(&self, dtb: &Path, dts: &Path) -> Result<()> {
        tracing::info!(dtb = %dtb.display(), dts = %dts.display(), "Decompiling device tree");
        run(
            Command::new(&self.dtc)
                .args(["-I", "dtb", "-O", "dts", "-@", "-A", "-o"])
                .arg(dts)
                .arg(dtb),
            "dtc",
        )
        .await
    }

    async fn preprocess(&self, source: &Path, output: &Path) -> Result<()> {
        let cpp = which::which(&self.cpp)
            .with_context(|| format!("C preprocessor `{}` not found", self.cpp.display()))?;
        let mut cmd = Command::new(cpp);
        cmd.args(["-nostdinc", "-undef", "-D__DTS__", "-x", "assembler-with-cpp"]);
        for dir in &self.include_dirs {
            cmd.arg("-I").arg(dir);
        }
        cmd.arg("-o").arg(output).arg(source);
        run(&mut cmd, "cpp").await
    }
}

fn with_suffix(path: &Path, suffix: impl AsRef<OsStr>) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

async fn remove_file(path: &Path) -> Result<()> {
    tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("could not remove {}", path.display()))
}

// A failed preprocessor may or may not have left its output behind.
async fn discard(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other.with_context(|| format!("could not remove {}", path.display())),
    }
}

async fn run(cmd: &mut Command, what: &str) -> Result<()> {
    tracing::debug!(command = ?cmd.as_std(), "Running {what}");
    let status = cmd
        .status()
        .await
        .with_context(|| format!("could not start {what}"))?;
    if !status.success() {
        bail!("{what} failed with status {status}");
    }
    Ok(())
}
