//! Shared bootstrap glue for the three onionmesh binaries (directory,
//! relay, client): logging initialization so all three start up the
//! same way.

mod api;

use tracing::Level;

pub use api::StatusServer;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();
}
