//! Session coordination
//!
//! Ties the registry, control arbitration and notification fan-out together
//! behind a single coordinator task. [`SessionHandle`] is the only way in;
//! each negotiated peer additionally gets a channel router that turns its
//! transport events into coordinator commands.

pub mod arbiter;
pub mod config;
pub mod coordinator;
pub mod handle;
pub(crate) mod router;
pub mod state;

pub use arbiter::{ArbitrationError, ControlArbiter};
pub use config::SessionConfig;
pub use coordinator::{ControlRoute, PeerView};
pub use handle::SessionHandle;
pub use state::{PeerPhase, Transition};

#[cfg(test)]
mod tests;
