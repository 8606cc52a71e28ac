use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use onionmesh_common::{limits, ClientConfig, FileConfig};
use onionmesh_core::{build_circuit, query_directory, select_hops};
use tracing::info;

/// The client operator interface (spec.md §6): build a circuit through
/// `hop_count` randomly chosen relays and tunnel one HTTP GET through it,
/// writing the raw response bytes to stdout.
#[derive(Parser, Debug)]
#[command(name = "onionmesh-client")]
struct Args {
    /// URL (or bare host:port) to fetch through the circuit.
    url: String,

    #[arg(long, default_value = "127.0.0.1")]
    directory_ip: String,

    #[arg(long, default_value_t = 12345)]
    directory_port: u16,

    #[arg(long, default_value_t = 3)]
    hop_count: usize,

    /// Optional TOML config file; overrides the above when present.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    onionmesh_daemon::init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) if path.exists() => {
            ClientConfig::from_file(path).context("failed to load client config")?
        }
        _ => ClientConfig {
            directory_ip: args.directory_ip,
            directory_port: args.directory_port,
            hop_count: args.hop_count,
        },
    };

    let directory_addr: SocketAddr = format!("{}:{}", config.directory_ip, config.directory_port)
        .parse()
        .context("invalid directory address")?;

    let registry = query_directory(directory_addr, limits::DEFAULT_TIMEOUT)
        .await
        .context("failed to query directory")?;
    let hops = match select_hops(&registry, config.hop_count) {
        Ok(hops) => hops,
        Err(e) => bail!("{e}"),
    };
    info!(hops = hops.len(), "selected circuit hops");

    let mut circuit = build_circuit(&hops, limits::DEFAULT_TIMEOUT)
        .await
        .context("failed to build circuit")?;
    info!("circuit built, sending request");

    let response = circuit
        .send_request(args.url.clone().into_bytes(), limits::DEFAULT_TIMEOUT)
        .await
        .context("tunneled request failed")?;

    circuit.close(limits::DEFAULT_TIMEOUT).await.ok();

    use std::io::Write;
    std::io::stdout().write_all(&response)?;
    Ok(())
}
