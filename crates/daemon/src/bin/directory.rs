use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use onionmesh_common::{DirectoryConfig, FileConfig};
use onionmesh_core::DirectoryService;
use tracing::{error, info};

/// The directory service (spec.md §4.1): registers relays and answers
/// registry queries. Holds no persistent state across restarts.
#[derive(Parser, Debug)]
#[command(name = "onionmesh-directory")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    #[arg(long, default_value_t = 12345)]
    port: u16,

    /// Optional TOML config file; overrides --ip/--port when present.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    onionmesh_daemon::init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) if path.exists() => {
            DirectoryConfig::from_file(path).context("failed to load directory config")?
        }
        _ => DirectoryConfig {
            ip: args.ip,
            port: args.port,
        },
    };

    let addr: SocketAddr = format!("{}:{}", config.ip, config.port)
        .parse()
        .context("invalid listen address")?;

    let service = DirectoryService::new();
    info!(%addr, "starting directory");
    if let Err(e) = service.serve(addr).await {
        error!(error = %e, "directory terminated");
        std::process::exit(1);
    }
    Ok(())
}
