pub mod client;
pub mod codec;
pub mod crypto;
pub mod directory;
pub mod exit;
pub mod node;
pub mod packet;
pub mod rsa_wrap;
pub mod switchboard;
pub mod tables;

pub use client::{build_circuit, select_hops, Circuit};
pub use crypto::{decrypt_sym, encrypt_sym, generate_key, LayerKey};
pub use directory::{query_directory, register_with_directory, DirectoryService, Registry, StopHandle};
pub use exit::{ExitFetch, HttpExitFetch};
pub use node::{run_relay, run_relay_with_exit};
pub use packet::{ControlCommand, ControlPayload, Packet, RelayCommand, RelayPayload};
pub use rsa_wrap::{wrap_key, LongTermKeyPair};
pub use switchboard::{RelayNode, RelayStopHandle, Switchboard, SwitchboardStats};
pub use tables::{CircuitTable, NodeKeyTable, NodeRelayTable, PeerAddr, SenderKeyTable};
