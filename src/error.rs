//! Crate-level error type

use crate::protocol::EnvelopeError;
use crate::registry::RegistryError;
use crate::session::ArbitrationError;
use crate::signaling::SignalingError;
use crate::transport::{ForwardError, TransportError};

/// Error type for relay operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The session coordinator is no longer running
    #[error("session coordinator has shut down")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;
