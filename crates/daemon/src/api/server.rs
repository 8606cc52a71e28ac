use std::net::SocketAddr;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use onionmesh_core::RelayStopHandle;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::handlers::{get_relay_status, health_check, AppState};

/// Read-only status server for one relay process (SPEC_FULL.md §1/§6).
/// Entirely separate from the relay's own switchboard listener — this is
/// an operator-facing surface, never part of the overlay protocol.
pub struct StatusServer {
    listen_addr: SocketAddr,
    state: AppState,
}

impl StatusServer {
    pub fn new(
        listen_addr: SocketAddr,
        stop_handle: RelayStopHandle,
        relay_ip: String,
        relay_port: u16,
    ) -> Self {
        Self {
            listen_addr,
            state: AppState {
                stop_handle,
                listen_ip: relay_ip,
                listen_port: relay_port,
            },
        }
    }

    pub async fn run(self) -> Result<()> {
        let app = Router::new()
            .route("/health", get(health_check))
            .route("/status", get(get_relay_status))
            .layer(CorsLayer::permissive())
            .with_state(self.state);

        info!(addr = %self.listen_addr, "status API listening");
        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("status API error: {e}"))?;
        Ok(())
    }
}
