//! The `ersd` registry daemon.
//!
//! Wires the daemon with the in-process DocDB and the manually driven
//! discovery backend; deployments embedding a real document database or a
//! zeroconf transport assemble [`ers_node::daemon::Daemon`] themselves.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use ers_node::{
    config::Config, daemon::Daemon, discovery::ManualDiscovery, docdb::memory::MemoryHub,
};

/// Exit code for configuration or runtime fatals (EX_SOFTWARE).
const EXIT_SOFTWARE: u8 = 70;

#[derive(Debug, Parser)]
#[command(name = "ersd", about = "Entity Registry System daemon", version)]
struct Args {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(short, long, default_value = "ers.ini")]
    config: PathBuf,

    /// Override the node type (contributor or bridge).
    #[arg(short = 't', long, value_name = "TYPE")]
    node_type: Option<String>,

    /// Override the pid file path; `none` disables it.
    #[arg(long, value_name = "PATH")]
    pid_file: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(EXIT_SOFTWARE)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)
            .with_context(|| format!("loading `{}`", args.config.display()))?
    } else {
        Config::default()
    };
    if let Some(node_type) = args.node_type {
        config.node.peer_type = node_type
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown node type `{node_type}`"))?;
    }
    if let Some(pid_file) = args.pid_file {
        config.node.pid_file = pid_file;
    }
    config.log.init()?;

    let hub = MemoryHub::new();
    hub.add_node(&config.local_docdb_url());
    let discovery = Arc::new(ManualDiscovery::new());

    let daemon = Daemon::start(config, hub.connector(), discovery)
        .await
        .context("starting the daemon")?;
    daemon.run().await.context("running the daemon")?;
    Ok(())
}
