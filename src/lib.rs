//! car-relay: forwarding server between a single car and its web clients
//!
//! One privileged producer peer (the car) streams frames over WebRTC data
//! channels; any number of client peers receive those frames and may ask for
//! exclusive control, after which their control bytes are forwarded to the car.
//!
//! # Architecture
//!
//! ```text
//!   HTTP signaling (axum)                 transport events (webrtc)
//!   POST /car, /client, .../ice           StateChanged | ChannelOpened | MessageReceived
//!            │                                          │
//!            ▼                                          ▼
//!      Signaling ──accept_offer──► TransportEngine   ChannelRouter (one task per peer)
//!            │                                          │
//!            └────────────── SessionHandle ◄────────────┘
//!                                 │ mpsc<Command>
//!                                 ▼
//!                   Coordinator (single owner of state)
//!                   ├── PeerRegistry   (≤ 1 producer)
//!                   ├── ControlArbiter (active controller)
//!                   └── relay::deliver (concurrent sends, per-send timeout)
//! ```
//!
//! All registry and arbitration mutations are serialized through the
//! coordinator task, so a broadcast issued during an arbitration update never
//! contends with a lock held by its caller.

pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
pub use protocol::{ChannelKind, Envelope};
pub use registry::{PeerId, Role};
pub use server::{RelayServer, ServerConfig};
pub use session::{SessionConfig, SessionHandle};
