//! In-memory transport for tests
//!
//! [`MockLink`] records every send and lets a test drive the live connection
//! state. [`MockEngine`] hands out mock links and keeps the event sender of
//! each negotiated peer so a test can inject transport events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    ConnectionState, ForwardError, IceCandidate, Negotiated, PeerEvent, PeerLink,
    SessionDescription, TransportEngine, TransportError,
};
use crate::protocol::{ChannelKind, Envelope};
use crate::registry::PeerId;

#[derive(Debug)]
pub struct MockLink {
    state: Mutex<ConnectionState>,
    sent: Mutex<Vec<(ChannelKind, Bytes)>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    local_candidates: Vec<IceCandidate>,
    fail_sends: AtomicBool,
    stall_sends: AtomicBool,
    closed: AtomicBool,
}

impl MockLink {
    pub fn new(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            local_candidates: vec![IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.1 40000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            }],
            fail_sends: AtomicBool::new(false),
            stall_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn connected() -> Arc<Self> {
        Self::new(ConnectionState::Connected)
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Make every subsequent send fail
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent send hang until the caller gives up
    pub fn stall_sends(&self, stall: bool) {
        self.stall_sends.store(stall, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Payloads sent on one channel, in order
    pub fn sent_on(&self, channel: ChannelKind) -> Vec<Bytes> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Envelopes sent on the meta channel, decoded
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.sent_on(ChannelKind::Meta)
            .iter()
            .map(|b| Envelope::decode(b).expect("relay sent an undecodable envelope"))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn send(&self, channel: ChannelKind, payload: Bytes) -> Result<(), ForwardError> {
        if self.stall_sends.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ForwardError::Transport("mock send failure".into()));
        }
        self.sent.lock().unwrap().push((channel, payload));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if candidate.candidate.starts_with("garbage") {
            return Err(TransportError::InvalidCandidate(candidate.candidate));
        }
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates.clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
    }
}

/// Engine that accepts any offer whose SDP is non-empty
#[derive(Default)]
pub struct MockEngine {
    /// Every session negotiated per peer, oldest first. Senders are kept so
    /// a superseded session's event stream stays open.
    peers: Mutex<HashMap<PeerId, Vec<(Arc<MockLink>, mpsc::Sender<PeerEvent>)>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Link and event injector of the most recent session negotiated for `peer`
    pub fn peer(&self, peer: &str) -> Option<(Arc<MockLink>, mpsc::Sender<PeerEvent>)> {
        self.peers
            .lock()
            .unwrap()
            .get(peer)
            .and_then(|sessions| sessions.last().cloned())
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn accept_offer(
        &self,
        peer: &PeerId,
        offer: SessionDescription,
    ) -> Result<Negotiated, TransportError> {
        if offer.sdp.trim().is_empty() {
            return Err(TransportError::InvalidOffer("empty sdp".into()));
        }

        let link = MockLink::new(ConnectionState::New);
        let (tx, rx) = mpsc::channel(64);
        self.peers
            .lock()
            .unwrap()
            .entry(peer.clone())
            .or_default()
            .push((Arc::clone(&link), tx));

        Ok(Negotiated {
            link,
            answer: SessionDescription::answer(format!("answer-for-{peer}")),
            events: rx,
        })
    }
}
