//! Session coordinator configuration

use std::time::Duration;

use crate::registry::PeerId;

/// Configuration for the session coordinator and its routers
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identity every producer is registered under
    pub producer_id: PeerId,

    /// Deadline for a single send to a single peer
    pub send_timeout: Duration,

    /// Delay after a client connects before it is told the car's state
    /// (None = only on the client's explicit ready signal)
    pub ready_fallback: Option<Duration>,

    /// Drop control bytes from clients that do not hold control
    pub require_control_grant: bool,

    /// Depth of the coordinator command queue
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            producer_id: PeerId::from("car"),
            send_timeout: Duration::from_millis(500),
            ready_fallback: Some(Duration::from_secs(2)),
            require_control_grant: false,
            command_buffer: 1024,
        }
    }
}

impl SessionConfig {
    /// Set the producer identity
    pub fn producer_id(mut self, id: impl Into<PeerId>) -> Self {
        self.producer_id = id.into();
        self
    }

    /// Set the per-send deadline
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set or disable the delayed producer-state notification
    pub fn ready_fallback(mut self, delay: Option<Duration>) -> Self {
        self.ready_fallback = delay;
        self
    }

    /// Only forward control bytes from the active controller
    pub fn require_control_grant(mut self, require: bool) -> Self {
        self.require_control_grant = require;
        self
    }

    /// Set the coordinator queue depth
    pub fn command_buffer(mut self, depth: usize) -> Self {
        self.command_buffer = depth.max(1);
        self
    }
}
