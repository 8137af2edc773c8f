//! Relay server bootstrap

pub mod config;
pub mod listener;

pub use config::{parse_server_address, ServerConfig};
pub use listener::RelayServer;
