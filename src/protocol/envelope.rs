//! Meta channel envelope
//!
//! Car and clients exchange the same envelope type. On the wire it is a JSON
//! object tagged by `"type"`:
//!
//! ```text
//! {"type":"producerState","connected":true,"clockOffset":-12}
//! {"type":"controllerState","activeControllerId":"A"}
//! {"type":"controlRequest","kind":"takeOver"}
//! {"type":"error","message":"..."}
//! {"type":"ready"}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of control request a client can make
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlRequestKind {
    /// Become the active controller
    TakeOver,
    /// Stop being the active controller
    Release,
}

/// Control-plane message carried on the `meta` channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Car connection state, with the car's clock offset in milliseconds
    #[serde(rename_all = "camelCase")]
    ProducerState { connected: bool, clock_offset: i64 },

    /// Identity of the active controller, empty when nobody holds control
    #[serde(rename_all = "camelCase")]
    ControllerState { active_controller_id: String },

    /// Client asks to take over or release control
    ControlRequest { kind: ControlRequestKind },

    /// Error report addressed to a single peer
    Error { message: String },

    /// Client has wired its meta handlers and wants the current state
    Ready,
}

/// Error decoding a meta payload
#[derive(Debug, thiserror::Error)]
#[error("invalid meta envelope: {0}")]
pub struct EnvelopeError(#[from] serde_json::Error);

impl Envelope {
    pub fn producer_state(connected: bool, clock_offset: i64) -> Self {
        Envelope::ProducerState {
            connected,
            clock_offset,
        }
    }

    pub fn controller_state(active_controller_id: impl Into<String>) -> Self {
        Envelope::ControllerState {
            active_controller_id: active_controller_id.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Envelope::Error {
            message: message.to_string(),
        }
    }

    /// Serialize for sending on the meta channel
    pub fn encode(&self) -> Bytes {
        // Every variant holds only strings, bools and integers.
        match serde_json::to_vec(self) {
            Ok(buf) => Bytes::from(buf),
            Err(e) => panic!("meta envelope failed to serialize: {e}"),
        }
    }

    /// Parse a payload received on the meta channel
    pub fn decode(payload: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
