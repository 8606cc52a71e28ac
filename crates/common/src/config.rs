use serde::{Deserialize, Serialize};
use std::path::Path;

/// Protocol-wide constants (spec.md §3, §5, §7).
pub mod limits {
    use std::time::Duration;

    /// Inclusive upper bound for a freshly drawn circID.
    pub const MAX_CIRC_ID: u32 = 10_000;

    /// Soft cap on concurrently active circuits per relay.
    pub const MAX_CIRCUITS: usize = 100;

    /// Default timeout for any single blocking I/O operation.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    /// Retries for a per-hop send/receive before the whole multi-hop
    /// operation aborts.
    pub const MAX_RETRIES: u32 = 3;

    /// Size, in bytes, of the symmetric key wrapped in a `create` payload.
    pub const SYMMETRIC_KEY_LEN: usize = 32;

    /// Fixed size of the padding placed in every `control/created` reply
    /// and in the exit's failure-path `relay_ans`, so the two are not
    /// distinguishable by length (spec.md §9, Open Questions).
    pub const CONTROL_PADDING_LEN: usize = 32;

    /// Bits of the RSA modulus each relay/client generates at boot.
    pub const RSA_KEY_BITS: usize = 2048;
}

/// Configuration for a relay node's switchboard process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub ip: String,
    pub port: u16,
    pub directory_ip: String,
    pub directory_port: u16,
    /// Port for the read-only status HTTP endpoint. `None` disables it.
    #[serde(default)]
    pub status_port: Option<u16>,
}

/// Configuration for the directory service process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub ip: String,
    pub port: u16,
}

/// Configuration for a client building circuits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub directory_ip: String,
    pub directory_port: u16,
    #[serde(default = "default_hop_count")]
    pub hop_count: usize,
}

fn default_hop_count() -> usize {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            directory_ip: "127.0.0.1".to_string(),
            directory_port: 12345,
            hop_count: default_hop_count(),
        }
    }
}

/// Shared load/save behavior for the three config shapes above.
pub trait FileConfig: Sized + Serialize + for<'de> Deserialize<'de> {
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Write(e.to_string()))
    }
}

impl FileConfig for RelayConfig {}
impl FileConfig for DirectoryConfig {}
impl FileConfig for ClientConfig {}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to serialize config: {0}")]
    Serialize(String),
    #[error("failed to write config file: {0}")]
    Write(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_defaults_to_three_hops() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.hop_count, 3);
    }

    #[test]
    fn relay_config_round_trips_through_toml() {
        let dir = std::env::temp_dir().join("onionmesh_test_relay_config.toml");
        let cfg = RelayConfig {
            ip: "127.0.0.1".into(),
            port: 9001,
            directory_ip: "127.0.0.1".into(),
            directory_port: 12345,
            status_port: None,
        };
        cfg.to_file(&dir).unwrap();
        let loaded = RelayConfig::from_file(&dir).unwrap();
        assert_eq!(loaded.port, 9001);
        std::fs::remove_file(&dir).ok();
    }
}
