use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use onionmesh_common::{OnionMeshError, RelayConfig, RelayDescriptor, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::directory::register_with_directory;
use crate::exit::{ExitFetch, HttpExitFetch};
use crate::rsa_wrap::LongTermKeyPair;
use crate::switchboard::{RelayNode, RelayStopHandle};

/// Boots one relay process end to end (spec.md §2's control flow):
/// generate the long-term RSA identity, register it with the directory,
/// then run the switchboard's accept loop until stopped.
pub async fn run_relay(config: RelayConfig, timeout: Duration) -> Result<RelayStopHandle> {
    run_relay_with_exit(config, Arc::new(HttpExitFetch::default()), timeout).await
}

/// Same as [`run_relay`], but with an injectable exit fetch — the seam
/// the test suite uses to stand in a mock website (spec.md §8, S3/S4).
pub async fn run_relay_with_exit(
    config: RelayConfig,
    exit_fetch: Arc<dyn ExitFetch>,
    timeout: Duration,
) -> Result<RelayStopHandle> {
    let listen_addr: SocketAddr = format!("{}:{}", config.ip, config.port)
        .parse()
        .map_err(|e| OnionMeshError::protocol(format!("bad listen address: {e}")))?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(OnionMeshError::Io)?;
    let bound_port = listener
        .local_addr()
        .map_err(OnionMeshError::Io)?
        .port();

    let keypair = Arc::new(LongTermKeyPair::generate()?);
    let (public_exp, modulus) = keypair.public_exponent_and_modulus();
    let descriptor = RelayDescriptor::new(config.ip.clone(), bound_port, public_exp, modulus);

    let directory_addr: SocketAddr = format!("{}:{}", config.directory_ip, config.directory_port)
        .parse()
        .map_err(|e| OnionMeshError::protocol(format!("bad directory address: {e}")))?;
    register_with_directory(directory_addr, descriptor, timeout).await?;
    info!(ip = %config.ip, port = bound_port, "registered with directory");

    let relay = Arc::new(RelayNode::new(keypair, exit_fetch, timeout));
    let stop_handle = relay.stop_handle();

    tokio::spawn(async move {
        if let Err(e) = relay.serve_listener(listener).await {
            tracing::error!(error = %e, "relay accept loop exited");
        }
    });

    Ok(stop_handle)
}
