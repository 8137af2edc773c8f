//! Transport seam
//!
//! The relay does not negotiate sessions itself. A [`TransportEngine`] turns an
//! offer into a live [`PeerLink`] plus a stream of [`PeerEvent`]s, and the rest
//! of the crate only ever talks to those two.
//!
//! Events are delivered through a queue instead of callbacks that capture
//! shared state, so transport timing never decides when session state changes.

pub mod error;
#[cfg(test)]
pub mod mock;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::ChannelKind;
use crate::registry::PeerId;

pub use error::{ForwardError, TransportError};

/// Connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Disconnected, Failed and Closed all end the session
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Session description exchanged during signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".into(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Raw transport-level event for one peer
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Peer connection changed state
    StateChanged(ConnectionState),
    /// A data channel with this label is open for communication
    ChannelOpened(String),
    /// One transport message arrived on the labelled channel
    MessageReceived { label: String, data: Bytes },
}

/// A negotiated peer session
#[async_trait]
pub trait PeerLink: Send + Sync + fmt::Debug {
    /// Send one message on a channel. Payloads are never split or merged.
    async fn send(&self, channel: ChannelKind, payload: Bytes) -> Result<(), ForwardError>;

    /// Live connection state at the moment of the call
    fn connection_state(&self) -> ConnectionState;

    /// Add a remote ICE candidate
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// All local candidates gathered so far
    async fn local_candidates(&self) -> Vec<IceCandidate>;

    /// Tear down the session and release its resources
    async fn close(&self);
}

/// Result of accepting an offer
pub struct Negotiated {
    pub link: Arc<dyn PeerLink>,
    pub answer: SessionDescription,
    pub events: mpsc::Receiver<PeerEvent>,
}

/// Session negotiation engine
#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Create a session from a remote offer and produce the local answer
    async fn accept_offer(
        &self,
        peer: &PeerId,
        offer: SessionDescription,
    ) -> Result<Negotiated, TransportError>;
}
