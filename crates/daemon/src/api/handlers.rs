use super::responses::*;
use axum::extract::State;
use axum::Json;
use onionmesh_core::RelayStopHandle;
use tracing::debug;

/// Shared state for the status API: just enough to report the relay's
/// own routing-table snapshot, never keys or payload content.
#[derive(Clone)]
pub struct AppState {
    pub stop_handle: RelayStopHandle,
    pub listen_ip: String,
    pub listen_port: u16,
}

pub async fn health_check() -> Json<HealthResponse> {
    debug!("status API: GET /health");
    Json(HealthResponse { status: "ok" })
}

pub async fn get_relay_status(State(state): State<AppState>) -> Json<RelayStatusResponse> {
    debug!("status API: GET /status");
    let stats = state.stop_handle.stats().await;
    Json(RelayStatusResponse {
        listen_ip: state.listen_ip,
        listen_port: state.listen_port,
        active_circuits: stats.active_circuits,
        forwarding_legs: stats.forwarding_legs,
        max_circuits: stats.max_circuits,
        oldest_circuit_age_secs: stats.oldest_circuit_age_secs,
    })
}
