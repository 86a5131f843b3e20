use anyhow::Result;
use clap::Parser;
use dtc_builder::{Outcome, Toolchain};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dtc-builder", about = "Preprocess and compile board device trees")]
struct Cli {
    /// Root of the RT-Thread tree (defaults to two levels above the current directory)
    #[arg(long, env = "RTT_ROOT")]
    rtt_root: Option<PathBuf>,

    /// Use this dtc instead of building the bundled one
    #[arg(long)]
    dtc: Option<PathBuf>,

    /// C preprocessor to expand sources with
    #[arg(long)]
    cpp: Option<PathBuf>,

    /// Treat inputs as .dtb files and write .dts next to them
    #[arg(long)]
    decompile: bool,

    /// Device-tree files to process
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let root = dtc_builder::rtt_root(cli.rtt_root)?;

    let mut toolchain = match cli.dtc {
        Some(dtc) => Toolchain::new(dtc).with_include(root.join(dtc_builder::INCLUDE_SUBDIR)),
        None if cli.decompile => Toolchain::system()?,
        None => Toolchain::bundled(&root).await?,
    };
    if let Some(cpp) = cli.cpp {
        toolchain = toolchain.with_preprocessor(cpp);
    }

    if cli.decompile {
        for dtb in &cli.files {
            toolchain.decompile(dtb, &dtc_builder::dts_path(dtb)).await?;
        }
        return Ok(());
    }

    let results = toolchain.compile_all(&cli.files).await?;
    let built = results.iter().filter(|c| c.outcome == Outcome::Built).count();
    tracing::info!(built, up_to_date = results.len() - built, "Device trees ready");
    Ok(())
}
