use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use onionmesh_common::{limits, FileConfig, RelayConfig};
use onionmesh_core::run_relay;
use onionmesh_daemon::StatusServer;
use tracing::{info, warn};

/// A relay node (spec.md §4.2): registers with the directory at boot,
/// then runs the switchboard's accept loop until interrupted.
#[derive(Parser, Debug)]
#[command(name = "onionmesh-relay")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    #[arg(long)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    directory_ip: String,

    #[arg(long, default_value_t = 12345)]
    directory_port: u16,

    /// Port for the read-only status HTTP endpoint (/health, /status).
    /// Omit to disable it entirely.
    #[arg(long)]
    status_port: Option<u16>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    onionmesh_daemon::init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) if path.exists() => {
            RelayConfig::from_file(path).context("failed to load relay config")?
        }
        _ => RelayConfig {
            ip: args.ip,
            port: args.port,
            directory_ip: args.directory_ip,
            directory_port: args.directory_port,
            status_port: args.status_port,
        },
    };
    let relay_ip = config.ip.clone();
    let relay_port = config.port;
    let status_port_cfg = config.status_port;

    let stop = run_relay(config, limits::DEFAULT_TIMEOUT)
        .await
        .context("relay failed to start")?;
    info!("relay running, press Ctrl+C to stop");

    if let Some(status_port) = status_port_cfg {
        let status_addr: SocketAddr = format!("{relay_ip}:{status_port}")
            .parse()
            .context("bad status address")?;
        let server = StatusServer::new(status_addr, stop.clone(), relay_ip, relay_port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!(error = %e, "status API exited");
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    stop.stop();
    // Give the accept loop one timeout window to notice and unwind
    // (spec.md §5's cancellation contract).
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}
