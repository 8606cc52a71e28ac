//! Wire shapes for the status API. Kept separate from the handlers that
//! build them, matching how the teacher's daemon crate splits the two.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RelayStatusResponse {
    pub listen_ip: String,
    pub listen_port: u16,
    pub active_circuits: usize,
    pub forwarding_legs: usize,
    pub max_circuits: usize,
    pub oldest_circuit_age_secs: Option<u64>,
}
