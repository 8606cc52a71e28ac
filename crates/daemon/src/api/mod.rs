mod handlers;
mod responses;
mod server;

pub use server::StatusServer;
