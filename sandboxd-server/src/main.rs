//! sandboxd daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use sandboxd_server::tcp::{bind, run_tcp_accept_loop};
use sandboxd_server::{ConfigLoader, ControlPlane};
use sandboxd_utils::{init_logging_with_config, LogConfig, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to the XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the PTY stream listen address
    #[arg(short, long)]
    listen: Option<String>,
}

async fn run_daemon(args: Args) -> Result<()> {
    info!("sandboxd starting");

    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load()?,
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    ConfigLoader::validate(&config)?;

    let listener = bind(&config.server.listen_addr).await?;
    let plane = ControlPlane::new(config);
    let maintenance = plane.spawn_maintenance();
    let accept = tokio::spawn(run_tcp_accept_loop(
        listener,
        Arc::clone(plane.ptys()),
        plane.subscribe_shutdown(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");

    plane.shutdown().await;
    let _ = accept.await;
    let _ = maintenance.await;

    info!("sandboxd stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging_with_config(LogConfig::server())?;
    run_daemon(args).await
}
