//! Peer registry
//!
//! Maps peer identity to its negotiated session. At most one entry may hold
//! the producer role; any number may be clients.
//!
//! ```text
//!                      PeerRegistry
//!              ┌──────────────────────────┐
//!              │ peers: HashMap<PeerId,   │
//!              │   PeerEntry {            │
//!              │     role, link,          │
//!              │     channels, phase,     │
//!              │   }                      │
//!              │ >                        │
//!              │ producer: Option<PeerId> │
//!              └────────────┬─────────────┘
//!                           │ snapshot()
//!                           ▼
//!              Vec<Recipient> ──► relay::deliver ──► PeerLink::send
//! ```
//!
//! The registry itself is a plain owned value; the session coordinator is its
//! only owner and serializes every access. Iteration therefore always sees a
//! consistent set of peers, and [`Recipient`] snapshots can be sent to outside
//! the coordinator without holding anything.
//!
//! [`Recipient`]: crate::relay::Recipient

pub mod entry;
pub mod error;
pub mod store;

pub use entry::{OpenChannels, PeerEntry, PeerId, Role};
pub use error::RegistryError;
pub use store::PeerRegistry;
