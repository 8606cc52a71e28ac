pub mod config;
pub mod descriptor;
pub mod error;
pub mod types;

pub use config::{limits, ClientConfig, DirectoryConfig, FileConfig, RelayConfig};
pub use descriptor::RelayDescriptor;
pub use error::{OnionMeshError, Result};
pub use types::Timestamp;
