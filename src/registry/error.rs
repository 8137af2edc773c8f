//! Registry error types

use super::entry::PeerId;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A producer is already registered
    #[error("a producer is already registered as {0}")]
    DuplicateProducer(PeerId),

    /// The identity is already registered
    #[error("peer already registered: {0}")]
    DuplicatePeer(PeerId),

    /// No peer with this identity
    #[error("peer not found: {0}")]
    NotFound(PeerId),
}
