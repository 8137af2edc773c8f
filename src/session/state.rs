//! Peer lifecycle state machine
//!
//! Tracks a peer from offer acceptance to removal, driven by the connection
//! states the transport reports.
//!
//! ```text
//! New ──► Connecting ──► Connected ──► Gone
//!  │           │                        ▲
//!  └───────────┴────────────────────────┘
//!     (Disconnected | Failed | Closed)
//! ```

use crate::transport::ConnectionState;

/// Lifecycle phase of a registered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Offer accepted, transport not yet connecting
    New,
    /// Transport is establishing the connection
    Connecting,
    /// Transport is connected
    Connected,
    /// Disconnected, failed or closed. Terminal.
    Gone,
}

/// Change produced by feeding a transport state into the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to act on
    Unchanged,
    /// Entered Connecting
    Connecting,
    /// Entered Connected
    Connected,
    /// Entered Gone; the peer must be removed
    Gone,
}

impl PeerPhase {
    /// Advance with an observed transport state
    pub fn advance(&mut self, observed: ConnectionState) -> Transition {
        if *self == PeerPhase::Gone {
            return Transition::Unchanged;
        }

        if observed.is_terminal() {
            *self = PeerPhase::Gone;
            return Transition::Gone;
        }

        match (*self, observed) {
            (PeerPhase::New, ConnectionState::Connecting) => {
                *self = PeerPhase::Connecting;
                Transition::Connecting
            }
            (PeerPhase::New | PeerPhase::Connecting, ConnectionState::Connected) => {
                *self = PeerPhase::Connected;
                Transition::Connected
            }
            _ => Transition::Unchanged,
        }
    }

    pub fn is_gone(self) -> bool {
        self == PeerPhase::Gone
    }
}
