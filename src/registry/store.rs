//! Peer registry implementation

use std::collections::HashMap;

use crate::protocol::ChannelKind;
use crate::relay::Recipient;

use super::entry::{PeerEntry, PeerId, Role};
use super::error::RegistryError;

/// Mapping of peer identity to its session
///
/// Owned by the session coordinator, which serializes all access.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerEntry>,
    producer: Option<PeerId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer
    ///
    /// Fails if the identity is taken, or if the entry is a producer and a
    /// producer is already registered. The existing entry is left untouched.
    pub fn add(&mut self, entry: PeerEntry) -> Result<(), RegistryError> {
        if entry.role == Role::Producer {
            if let Some(existing) = &self.producer {
                return Err(RegistryError::DuplicateProducer(existing.clone()));
            }
        }
        if self.peers.contains_key(&entry.id) {
            return Err(RegistryError::DuplicatePeer(entry.id.clone()));
        }

        tracing::info!(peer = %entry.id, role = %entry.role, "Peer registered");

        if entry.role == Role::Producer {
            self.producer = Some(entry.id.clone());
        }
        self.peers.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PeerEntry> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PeerEntry> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Remove a peer. Removing an unknown identity is a no-op.
    pub fn remove(&mut self, id: &str) -> Option<PeerEntry> {
        let entry = self.peers.remove(id)?;
        if entry.role == Role::Producer {
            self.producer = None;
        }
        tracing::info!(peer = %entry.id, role = %entry.role, "Peer unregistered");
        Some(entry)
    }

    /// The registered producer, if any
    pub fn producer(&self) -> Option<&PeerEntry> {
        self.producer.as_ref().and_then(|id| self.peers.get(id))
    }

    /// Visit every peer once
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&PeerEntry),
    {
        for entry in self.peers.values() {
            visit(entry);
        }
    }

    /// Send targets on `channel` for every peer matching `filter`
    pub fn recipients<F>(&self, channel: ChannelKind, filter: F) -> Vec<Recipient>
    where
        F: Fn(&PeerEntry) -> bool,
    {
        self.peers
            .values()
            .filter(|entry| filter(*entry))
            .map(|entry| entry.recipient(channel))
            .collect()
    }

    /// Remove every peer, producer included
    pub fn drain(&mut self) -> Vec<PeerEntry> {
        self.producer = None;
        self.peers.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
