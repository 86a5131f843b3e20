//! Device-tree dump/merge round trip for `-dtbo` overlays.
//!
//! QEMU generates the `virt` device tree itself, so overlays are applied by
//! asking it to dump that tree, decompiling the dump, appending the overlay
//! sources and compiling the result back into a tree that is passed with
//! `-dtb` on the real run.

use anyhow::{bail, Context, Result};
use dtc_builder::Toolchain;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use crate::command::{Environment, Invocation, Selection};
use crate::options::Options;

pub const DUMP_DTB: &str = "qemu.tmp.dtb";
pub const DUMP_DTS: &str = "qemu.tmp.dts";
pub const MERGED_DTS: &str = "qemu.run.dts";
pub const MERGED_DTB: &str = "qemu.run.dtb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Launch once with the flags as given.
    Direct,
    /// Launch with `dumpdtb` and decompile the dump.
    Dump,
    /// Merge overlays into the dump, compile and launch with `-dtb`.
    MergeAndRelaunch,
}

impl Stage {
    pub fn plan(opts: &Options) -> &'static [Stage] {
        if opts.dtbo.is_empty() {
            &[Stage::Direct]
        } else {
            &[Stage::Dump, Stage::MergeAndRelaunch]
        }
    }
}

/// Where the device-tree tools come from.
#[derive(Debug, Clone)]
pub struct DeviceTreeTools {
    pub rtt_root: PathBuf,
    /// Explicit `dtc`; when unset the bundled one is built for compiling and
    /// the one on `PATH` is used for decompiling.
    pub dtc: Option<PathBuf>,
    /// C preprocessor for overlay sources, `cpp` from `PATH` when unset.
    pub cpp: Option<PathBuf>,
}

impl DeviceTreeTools {
    fn decompiler(&self) -> Result<Toolchain> {
        match &self.dtc {
            Some(dtc) => Ok(Toolchain::new(dtc)),
            None => Toolchain::system(),
        }
    }

    async fn compiler(&self) -> Result<Toolchain> {
        let toolchain = match &self.dtc {
            Some(dtc) => Toolchain::new(dtc)
                .with_include(self.rtt_root.join(dtc_builder::INCLUDE_SUBDIR)),
            None => Toolchain::bundled(&self.rtt_root).await?,
        };
        Ok(match &self.cpp {
            Some(cpp) => toolchain.with_preprocessor(cpp),
            None => toolchain,
        })
    }
}

pub struct Pipeline<'a> {
    opts: &'a Options,
    sel: Selection,
    env: &'a Environment,
    work_dir: PathBuf,
    tools: DeviceTreeTools,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        opts: &'a Options,
        sel: Selection,
        env: &'a Environment,
        work_dir: impl Into<PathBuf>,
        tools: DeviceTreeTools,
    ) -> Self {
        Self {
            opts,
            sel,
            env,
            work_dir: work_dir.into(),
            tools,
        }
    }

    /// Runs every stage and returns the exit status of the last launch.
    pub async fn run(&self) -> Result<ExitStatus> {
        let mut status = None;
        for stage in Stage::plan(self.opts) {
            tracing::debug!(?stage, "Entering device-tree stage");
            status = Some(match stage {
                Stage::Direct => self.direct().await?,
                Stage::Dump => self.dump().await?,
                Stage::MergeAndRelaunch => self.merge_and_relaunch().await?,
            });
        }
        status.context("no launch stage ran")
    }

    async fn direct(&self) -> Result<ExitStatus> {
        let status = self.launch(self.opts).await?;
        if let Some(dump) = &self.opts.dumpdtb {
            if status.success() {
                self.tools
                    .decompiler()?
                    .decompile(dump, &dtc_builder::dts_path(dump))
                    .await?;
            }
        }
        Ok(status)
    }

    async fn dump(&self) -> Result<ExitStatus> {
        let dump_dtb = self.work_dir.join(DUMP_DTB);
        let opts = Options {
            dumpdtb: Some(dump_dtb.clone()),
            ..self.opts.clone()
        };
        let status = self.launch(&opts).await?;
        if !status.success() {
            bail!("QEMU failed to dump its device tree ({status})");
        }
        let decompiled = match self.tools.decompiler() {
            Ok(dtc) => dtc.decompile(&dump_dtb, &self.work_dir.join(DUMP_DTS)).await,
            Err(e) => Err(e),
        };
        discard(&dump_dtb).await?;
        decompiled?;
        Ok(status)
    }

    async fn merge_and_relaunch(&self) -> Result<ExitStatus> {
        let dump_dts = self.work_dir.join(DUMP_DTS);
        let merged_dts = self.work_dir.join(MERGED_DTS);
        let merged_dtb = self.work_dir.join(MERGED_DTB);

        let mut sources = vec![dump_dts.clone()];
        sources.extend(self.opts.dtbo.iter().cloned());
        let merged = merge_sources(&sources, &merged_dts).await;
        discard(&dump_dts).await?;
        if merged.is_err() {
            discard(&merged_dts).await?;
        }
        merged?;

        // A tree left over from an earlier failed run must not pass the
        // freshness check.
        if tokio::fs::try_exists(&merged_dtb).await? {
            remove(&merged_dtb).await?;
        }
        let compiled = self.tools.compiler().await?.compile(&merged_dts).await;
        remove(&merged_dts).await?;
        let compiled = compiled?;

        let opts = Options {
            dumpdtb: None,
            dtb: Some(compiled.binary.clone()),
            ..self.opts.clone()
        };
        let status = self.launch(&opts).await?;
        if status.success() {
            remove(&compiled.binary).await?;
        } else {
            tracing::warn!(dtb = %compiled.binary.display(), %status, "QEMU failed, keeping merged device tree");
        }
        Ok(status)
    }

    async fn launch(&self, opts: &Options) -> Result<ExitStatus> {
        let invocation = Invocation::assemble(opts, &self.sel, self.env)?;
        tracing::info!(command = %invocation, "Launching QEMU");
        invocation
            .command()
            .status()
            .await
            .with_context(|| format!("could not start {}", invocation.program.display()))
    }
}

/// Concatenates `sources` in order into `output`.
pub async fn merge_sources(sources: &[PathBuf], output: &Path) -> Result<()> {
    let mut merged = String::new();
    for source in sources {
        let text = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("could not read {}", source.display()))?;
        merged.push_str(&text);
        if !merged.ends_with('\n') {
            merged.push('\n');
        }
    }
    tokio::fs::write(output, merged)
        .await
        .with_context(|| format!("could not write {}", output.display()))
}

async fn remove(path: &Path) -> Result<()> {
    tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("could not remove {}", path.display()))
}

/// Like [`remove`], for files a failed tool may never have written.
async fn discard(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other.with_context(|| format!("could not remove {}", path.display())),
    }
}
