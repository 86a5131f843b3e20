use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use qemu_launcher::command::{DEFAULT_KERNEL, DEFAULT_QEMU};
use qemu_launcher::overlay::{DeviceTreeTools, Pipeline};
use qemu_launcher::{disk, Environment, Host, Invocation, Options, QemuVersion, Selection};

#[derive(Parser)]
#[command(
    name = "qemu-launcher",
    about = "Launch the qemu-virt64-aarch64 board in QEMU",
    after_help = "Board flags follow the launcher options, e.g. `qemu-launcher --dry-run -smp 12 -graphic -dtbo leds.dts`"
)]
struct Cli {
    /// Root of the RT-Thread tree (defaults to two levels above the current directory)
    #[arg(long, env = "RTT_ROOT")]
    rtt_root: Option<PathBuf>,

    /// Emulator binary
    #[arg(long, default_value = DEFAULT_QEMU)]
    qemu: PathBuf,

    /// Disk image tool
    #[arg(long, default_value = "qemu-img")]
    qemu_img: PathBuf,

    /// Kernel image to boot
    #[arg(long, default_value = DEFAULT_KERNEL)]
    kernel: PathBuf,

    /// Device-tree compiler used for overlays (defaults to building tools/dtc)
    #[arg(long)]
    dtc: Option<PathBuf>,

    /// C preprocessor for overlay sources
    #[arg(long)]
    cpp: Option<PathBuf>,

    /// Print the QEMU command line instead of running it
    #[arg(long)]
    dry_run: bool,

    /// With --dry-run, print the invocation as JSON
    #[arg(long, requires = "dry_run")]
    json: bool,

    /// Board flags (-smp N, -mem N, -graphic, -dtbo FILE, ...)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "BOARD_FLAGS")]
    flags: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let opts = Options::parse(cli.flags.iter().cloned())?;
    let sel = Selection::resolve(&opts)?;

    let qemu = which::which(&cli.qemu)
        .with_context(|| format!("`{}` not found in PATH", cli.qemu.display()))?;
    let version = QemuVersion::query(&qemu).await?;
    let host = Host::detect(&qemu);
    tracing::info!(qemu = %qemu.display(), %version, windows = host.windows, "Using QEMU");

    let env = Environment::new(version, host)
        .with_qemu(qemu)
        .with_kernel(cli.kernel);
    let invocation = Invocation::assemble(&opts, &sel, &env)?;

    if cli.dry_run {
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&invocation)?);
        } else {
            println!("{invocation}");
        }
        return Ok(());
    }

    let work_dir = std::env::current_dir().context("could not read current directory")?;
    let qemu_img = which::which(&cli.qemu_img)
        .with_context(|| format!("`{}` not found in PATH", cli.qemu_img.display()))?;
    disk::ensure_images(&invocation.disks, &work_dir, &qemu_img).await?;

    let tools = DeviceTreeTools {
        rtt_root: dtc_builder::rtt_root(cli.rtt_root)?,
        dtc: cli.dtc,
        cpp: cli.cpp,
    };
    let status = Pipeline::new(&opts, sel, &env, work_dir, tools).run().await?;
    if !status.success() {
        tracing::error!(%status, "QEMU exited with an error");
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
