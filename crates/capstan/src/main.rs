use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use capstan::{CapstanConfig, Manager};
use streamidx::builder::PcapDirBuilder;

/// Server core of the capstan packet-capture investigation tool.
#[derive(Parser)]
#[command(name = "capstan", version)]
struct Args {
    /// Path to the configuration file (default: ./capstan.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capture files (relative to the pcap directory) to import at
    /// startup, in addition to anything found in the directory.
    #[arg(long = "import")]
    imports: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = CapstanConfig::load(args.config.as_deref())?;
    capstan::telemetry::init(&config.telemetry.log_level);

    let pcap_dir = config.paths.pcap_dir.clone();
    let manager = Manager::start(config, Arc::new(PcapDirBuilder::new())).await?;

    let known: HashSet<String> = manager
        .known_pcaps()
        .await?
        .into_iter()
        .map(|p| p.filename)
        .collect();
    let mut queued = 0usize;
    for entry in fs::read_dir(&pcap_dir).context("failed to read pcap directory")? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !name.ends_with(".pcap") || known.contains(&name) {
            continue;
        }
        manager.import_pcap(name);
        queued += 1;
    }
    for name in args.imports {
        manager.import_pcap(name);
        queued += 1;
    }
    if queued > 0 {
        info!(pcaps = queued, "queued captures for import");
    }

    info!("capstan running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    manager.close().await;
    Ok(())
}
