use thiserror::Error;

/// Error taxonomy shared by every onionmesh role.
///
/// Variants mirror the error kinds spec.md §7 distinguishes: protocol
/// violations close a connection silently, crypto failures are either
/// routine (a forwarder's layer doesn't belong to it — handled without
/// this type at all, see `onionmesh_core::crypto`) or fatal (an intended
/// recipient's layer doesn't decrypt), resource exhaustion replies
/// `destroy`, network transients are retried, and fatal errors abort the
/// process with a non-zero exit.
#[derive(Debug, Error)]
pub enum OnionMeshError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("too many active circuits (max {max})")]
    TooManyCircuits { max: usize },

    #[error("not enough relays registered: need {needed}, have {available}")]
    NotEnoughRelays { needed: usize, available: usize },

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("no such circuit: {0}")]
    UnknownCircuit(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OnionMeshError>;

impl OnionMeshError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}
