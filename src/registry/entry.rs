//! Peer entry and identity types

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use crate::protocol::ChannelKind;
use crate::relay::Recipient;
use crate::session::state::PeerPhase;
use crate::transport::PeerLink;

/// Identity of a peer (the car's fixed id, or a client-chosen id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Role of a peer in the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The car: supplies frames, accepts control
    Producer,
    /// A web client: receives frames, may request control
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Which of a peer's channels have been opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenChannels {
    meta: bool,
    control: bool,
    frame: bool,
}

impl OpenChannels {
    /// Mark a channel open. Returns false if it already was.
    pub fn open(&mut self, channel: ChannelKind) -> bool {
        let slot = match channel {
            ChannelKind::Meta => &mut self.meta,
            ChannelKind::Control => &mut self.control,
            ChannelKind::Frame => &mut self.frame,
        };
        !std::mem::replace(slot, true)
    }

    pub fn is_open(&self, channel: ChannelKind) -> bool {
        match channel {
            ChannelKind::Meta => self.meta,
            ChannelKind::Control => self.control,
            ChannelKind::Frame => self.frame,
        }
    }
}

/// Registry entry for a single peer
#[derive(Debug)]
pub struct PeerEntry {
    /// Peer identity
    pub id: PeerId,

    /// Producer or client
    pub role: Role,

    /// Assigned by the coordinator on registration, unique per negotiated session
    pub session_id: u64,

    /// Negotiated session, released when the entry is removed
    pub link: Arc<dyn PeerLink>,

    /// Channels opened so far
    pub channels: OpenChannels,

    /// Lifecycle phase as driven by transport events
    pub phase: PeerPhase,

    /// Producer only: offer registration time minus receipt time, in ms
    pub clock_offset: i64,
}

impl PeerEntry {
    pub fn new(id: PeerId, role: Role, link: Arc<dyn PeerLink>) -> Self {
        Self {
            id,
            role,
            session_id: 0,
            link,
            channels: OpenChannels::default(),
            phase: PeerPhase::New,
            clock_offset: 0,
        }
    }

    pub fn with_clock_offset(mut self, clock_offset: i64) -> Self {
        self.clock_offset = clock_offset;
        self
    }

    pub fn is_producer(&self) -> bool {
        self.role == Role::Producer
    }

    /// Live connection status, read from the transport at call time
    pub fn is_live(&self) -> bool {
        self.link.connection_state().is_connected()
    }

    /// Snapshot this peer as a send target on `channel`
    pub fn recipient(&self, channel: ChannelKind) -> Recipient {
        Recipient {
            id: self.id.clone(),
            link: Arc::clone(&self.link),
            open: self.channels.is_open(channel),
        }
    }
}
