//! Server configuration

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Error;
use crate::registry::PeerId;
use crate::session::SessionConfig;
use crate::transport::webrtc::WebRtcSettings;

/// Default HTTP signaling port
pub const DEFAULT_PORT: u16 = 7500;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the signaling server binds to
    pub bind_addr: SocketAddr,

    /// Identity the car is always registered under
    pub producer_id: PeerId,

    /// Host IP advertised in ICE candidates (required for serving)
    pub public_ip: Option<String>,

    /// Inclusive UDP port range used for ICE
    pub ice_port_range: (u16, u16),

    /// Serve all ICE traffic on this one UDP port instead of the range
    pub ice_mux_port: Option<u16>,

    /// STUN/TURN server URLs (empty = LAN only)
    pub ice_servers: Vec<String>,

    /// Deadline for a single send to a single peer
    pub send_timeout: Duration,

    /// Delay before a newly connected client is told the car's state
    pub ready_fallback: Option<Duration>,

    /// Per-peer transport event queue depth
    pub event_buffer: usize,

    /// Coordinator command queue depth
    pub command_buffer: usize,

    /// Only forward control bytes from the active controller
    pub require_control_grant: bool,
}

/// Parse a bind address, tolerating an `http://` or `https://` prefix
pub fn parse_server_address(address: &str) -> Result<SocketAddr, Error> {
    let trimmed = address.trim();
    let bare = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    bare.parse()
        .map_err(|e| Error::Config(format!("invalid server address {address:?}: {e}")))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            producer_id: PeerId::from("car"),
            public_ip: None,
            ice_port_range: (40000, 40100),
            ice_mux_port: None,
            ice_servers: Vec::new(),
            send_timeout: Duration::from_millis(500),
            ready_fallback: Some(Duration::from_secs(2)),
            event_buffer: 256,
            command_buffer: 1024,
            require_control_grant: false,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| env::var(key).ok())
    }

    /// Overlay settings read through `lookup`. Unparseable values are ignored.
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ip) = lookup("ASE_FWSERVER_IP").filter(|ip| !ip.trim().is_empty()) {
            self.public_ip = Some(ip.trim().to_string());
        }
        if let Some(addr) = lookup("RELAY_BIND_ADDR").and_then(|a| a.parse().ok()) {
            self.bind_addr = addr;
        }
        let start = lookup("RELAY_ICE_PORT_START").and_then(|p| p.parse().ok());
        let end = lookup("RELAY_ICE_PORT_END").and_then(|p| p.parse().ok());
        if let (Some(start), Some(end)) = (start, end) {
            self.ice_port_range = (start, end);
        }
        if let Some(port) = lookup("RELAY_ICE_MUX_PORT").and_then(|p| p.parse().ok()) {
            self.ice_mux_port = Some(port);
        }
        if let Some(ms) = lookup("RELAY_SEND_TIMEOUT_MS").and_then(|t| t.parse().ok()) {
            self.send_timeout = Duration::from_millis(ms);
        }
        self
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the advertised host IP
    pub fn public_ip(mut self, ip: impl Into<String>) -> Self {
        self.public_ip = Some(ip.into());
        self
    }

    /// Set the ICE UDP port range
    pub fn ice_port_range(mut self, start: u16, end: u16) -> Self {
        self.ice_port_range = (start, end);
        self
    }

    /// Multiplex every peer's ICE traffic over one UDP port
    pub fn ice_mux_port(mut self, port: u16) -> Self {
        self.ice_mux_port = Some(port);
        self
    }

    /// Add a STUN/TURN server URL
    pub fn ice_server(mut self, url: impl Into<String>) -> Self {
        self.ice_servers.push(url.into());
        self
    }

    /// Set the per-send deadline
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set or disable the delayed car-state notification
    pub fn ready_fallback(mut self, delay: Option<Duration>) -> Self {
        self.ready_fallback = delay;
        self
    }

    /// Only forward control from the active controller
    pub fn require_control_grant(mut self, require: bool) -> Self {
        self.require_control_grant = require;
        self
    }

    /// Coordinator settings derived from this config
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .producer_id(self.producer_id.clone())
            .send_timeout(self.send_timeout)
            .ready_fallback(self.ready_fallback)
            .require_control_grant(self.require_control_grant)
            .command_buffer(self.command_buffer)
    }

    /// Transport settings derived from this config
    pub fn webrtc_settings(&self) -> WebRtcSettings {
        WebRtcSettings {
            public_ip: self.public_ip.clone(),
            ice_port_range: Some(self.ice_port_range),
            ice_mux_port: self.ice_mux_port,
            ice_servers: self.ice_servers.clone(),
            event_buffer: self.event_buffer,
        }
    }
}
