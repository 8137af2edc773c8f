//! Data channel protocol
//!
//! Every peer session carries three named data channels:
//!
//! - `meta`: bidirectional control-plane [`Envelope`]s
//! - `control`: client → car command bytes, relayed verbatim
//! - `frame`: car → clients media bytes, relayed verbatim
//!
//! Only `meta` has a format the relay understands. The other two are opaque.

pub mod channel;
pub mod envelope;

pub use channel::ChannelKind;
pub use envelope::{ControlRequestKind, Envelope, EnvelopeError};
