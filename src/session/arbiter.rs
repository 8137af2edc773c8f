//! Control arbitration
//!
//! Guards the identity of the single client allowed to drive the car. The
//! arbiter is only ever touched by the coordinator, which makes every
//! check-and-set atomic with respect to the registry it consults.

use crate::registry::{PeerId, PeerRegistry, Role};

/// Error type for control requests
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArbitrationError {
    /// A different, still connected client holds control
    #[error("cannot take over control: {0} is already the active controller")]
    AlreadyControlled(PeerId),

    /// The requester does not hold control
    #[error("cannot release control: you are not the active controller")]
    NotController,

    /// The requester is registered but its transport is not connected
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    /// Only clients may hold control
    #[error("peer {0} is not a client and cannot take control")]
    NotAClient(PeerId),

    /// The requester is not registered
    #[error("peer not found: {0}")]
    UnknownPeer(PeerId),
}

/// Active-controller state
#[derive(Debug, Default)]
pub struct ControlArbiter {
    active: Option<PeerId>,
}

impl ControlArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The active controller, if any
    pub fn active(&self) -> Option<&PeerId> {
        self.active.as_ref()
    }

    /// The active controller id, empty when nobody holds control
    pub fn active_id(&self) -> &str {
        self.active.as_ref().map(PeerId::as_str).unwrap_or("")
    }

    pub fn is_controller(&self, id: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.as_str() == id)
    }

    /// Grant control to `requester`
    ///
    /// Succeeds when nobody holds control, when the requester already holds
    /// it, or when the holder is no longer registered and connected.
    pub fn take_over(
        &mut self,
        requester: &str,
        registry: &PeerRegistry,
    ) -> Result<(), ArbitrationError> {
        let entry = registry
            .get(requester)
            .ok_or_else(|| ArbitrationError::UnknownPeer(PeerId::from(requester)))?;

        if entry.role != Role::Client {
            return Err(ArbitrationError::NotAClient(entry.id.clone()));
        }
        if !entry.is_live() {
            return Err(ArbitrationError::NotConnected(entry.id.clone()));
        }

        if let Some(holder) = &self.active {
            let holder_live = registry.get(holder.as_str()).is_some_and(|h| h.is_live());
            if holder.as_str() != requester && holder_live {
                return Err(ArbitrationError::AlreadyControlled(holder.clone()));
            }
            if !holder_live && holder.as_str() != requester {
                tracing::info!(stale = %holder, peer = requester, "Reclaiming control from disconnected controller");
            }
        }

        self.active = Some(entry.id.clone());
        Ok(())
    }

    /// Release control held by `requester`
    pub fn release(
        &mut self,
        requester: &str,
        registry: &PeerRegistry,
    ) -> Result<(), ArbitrationError> {
        if !registry.contains(requester) {
            return Err(ArbitrationError::UnknownPeer(PeerId::from(requester)));
        }
        if !self.is_controller(requester) {
            return Err(ArbitrationError::NotController);
        }

        self.active = None;
        Ok(())
    }

    /// Drop control if `id` holds it. Returns true if control was cleared.
    pub fn forget(&mut self, id: &str) -> bool {
        if self.is_controller(id) {
            self.active = None;
            true
        } else {
            false
        }
    }

    /// Clear control unconditionally
    pub fn reset(&mut self) {
        self.active = None;
    }

    /// Panics if the active controller is not a registered client.
    ///
    /// Every mutation keeps this true; a violation means the coordinator's
    /// serialization was bypassed.
    pub fn assert_consistent(&self, registry: &PeerRegistry) {
        if let Some(holder) = &self.active {
            match registry.get(holder.as_str()) {
                Some(entry) if entry.role == Role::Client => {}
                Some(_) => panic!("active controller {holder} is not a client"),
                None => panic!("active controller {holder} is not registered"),
            }
        }
    }
}
