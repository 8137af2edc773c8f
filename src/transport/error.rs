//! Transport error types

use crate::protocol::ChannelKind;

/// Error sending on an established session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    /// The channel has not been opened by the peer (yet)
    #[error("{0} channel is not open")]
    ChannelNotOpen(ChannelKind),

    /// Send did not complete within the per-send deadline
    #[error("send timed out")]
    Timeout,

    /// The transport rejected the send
    #[error("transport send failed: {0}")]
    Transport(String),
}

/// Error from the negotiation engine
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The remote offer could not be applied
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    /// The remote candidate could not be applied
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Engine failure unrelated to the remote input
    #[error("transport engine error: {0}")]
    Engine(String),
}
