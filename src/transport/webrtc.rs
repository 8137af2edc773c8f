//! WebRTC transport engine
//!
//! Peers create every data channel themselves; the relay only answers their
//! offer and picks the channels up by label as they open. Local ICE
//! candidates are collected as they are gathered and handed back on each
//! remote candidate exchange.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc_ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};

use super::{
    ConnectionState, ForwardError, IceCandidate, Negotiated, PeerEvent, PeerLink,
    SessionDescription, TransportEngine, TransportError,
};
use crate::protocol::ChannelKind;
use crate::registry::PeerId;

/// Settings for the WebRTC engine
#[derive(Debug, Clone)]
pub struct WebRtcSettings {
    /// Address advertised in host candidates (NAT 1:1 mapping)
    pub public_ip: Option<String>,

    /// Inclusive UDP port range for ICE
    pub ice_port_range: Option<(u16, u16)>,

    /// Single UDP port shared by every peer's ICE traffic. Takes precedence
    /// over `ice_port_range`.
    pub ice_mux_port: Option<u16>,

    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,

    /// Capacity of each peer's event queue
    pub event_buffer: usize,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            public_ip: None,
            ice_port_range: Some((40000, 40100)),
            ice_mux_port: None,
            ice_servers: Vec::new(),
            event_buffer: 256,
        }
    }
}

/// [`TransportEngine`] backed by the `webrtc` crate
pub struct WebRtcEngine {
    api: API,
    settings: WebRtcSettings,
}

impl WebRtcEngine {
    /// Build the engine
    ///
    /// With `ice_mux_port` set, the shared UDP socket is bound here, so this
    /// must run inside a Tokio runtime.
    pub fn new(settings: WebRtcSettings) -> Result<Self, TransportError> {
        let mut setting = SettingEngine::default();

        if let Some(port) = settings.ice_mux_port {
            let socket = bind_mux_socket(port)?;
            let mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
            setting.set_udp_network(UDPNetwork::Muxed(mux));
        } else if let Some((start, end)) = settings.ice_port_range {
            let ephemeral = EphemeralUDP::new(start, end).map_err(|e| {
                TransportError::Engine(format!("invalid ICE port range {start}-{end}: {e}"))
            })?;
            setting.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        // Advertise the host address so candidates resolve from outside a container
        if let Some(ip) = &settings.public_ip {
            setting.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new().with_setting_engine(setting).build();

        tracing::info!(
            public_ip = ?settings.public_ip,
            ice_ports = ?settings.ice_port_range,
            ice_mux_port = ?settings.ice_mux_port,
            ice_servers = settings.ice_servers.len(),
            "WebRTC engine ready"
        );

        Ok(Self { api, settings })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.settings.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.settings.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

fn bind_mux_socket(port: u16) -> Result<tokio::net::UdpSocket, TransportError> {
    let bind_err = |e: std::io::Error| {
        TransportError::Engine(format!("could not bind ICE UDP port {port}: {e}"))
    };

    let socket = std::net::UdpSocket::bind(("0.0.0.0", port)).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    tokio::net::UdpSocket::from_std(socket).map_err(bind_err)
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn accept_offer(
        &self,
        peer: &PeerId,
        offer: SessionDescription,
    ) -> Result<Negotiated, TransportError> {
        if offer.sdp_type != "offer" {
            return Err(TransportError::InvalidOffer(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| TransportError::InvalidOffer(e.to_string()))?;

        let pc = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|e| TransportError::Engine(format!("could not create peer connection: {e}")))?;
        let pc = Arc::new(pc);

        let (events, rx) = mpsc::channel(self.settings.event_buffer.max(1));
        let link = Arc::new(WebRtcLink {
            peer: peer.clone(),
            pc,
            channels: Arc::new(RwLock::new(HashMap::new())),
            local_candidates: Arc::new(Mutex::new(Vec::new())),
        });
        link.install_handlers(events);

        let answer = match link.answer(remote).await {
            Ok(answer) => answer,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        tracing::debug!(peer = %peer, "Created answer");
        Ok(Negotiated {
            link,
            answer,
            events: rx,
        })
    }
}

/// A live WebRTC peer connection
pub struct WebRtcLink {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
    channels: Arc<RwLock<HashMap<ChannelKind, Arc<RTCDataChannel>>>>,
    local_candidates: Arc<Mutex<Vec<IceCandidate>>>,
}

impl WebRtcLink {
    async fn answer(&self, offer: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::InvalidOffer(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Engine(format!("could not create answer: {e}")))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::Engine(format!("could not set local description: {e}")))?;

        let local = self.pc.local_description().await.unwrap_or(answer);
        Ok(SessionDescription::answer(local.sdp))
    }

    /// Forward every transport callback into the peer's event queue
    fn install_handlers(&self, events: mpsc::Sender<PeerEvent>) {
        let peer = self.peer.clone();
        let tx = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let peer = peer.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    tracing::debug!(peer = %peer, state = %s, "Peer connection state changed");
                    let _ = tx.send(PeerEvent::StateChanged(map_state(s))).await;
                })
            }));

        let peer = self.peer.clone();
        let channels = Arc::clone(&self.channels);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let peer = peer.clone();
                let channels = Arc::clone(&channels);
                let tx = events.clone();
                Box::pin(async move {
                    let label = dc.label().to_string();
                    tracing::debug!(peer = %peer, label = %label, "New data channel");
                    watch_channel(dc, label, channels, tx);
                })
            }));

        let peer = self.peer.clone();
        let candidates = Arc::clone(&self.local_candidates);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let peer = peer.clone();
                let candidates = Arc::clone(&candidates);
                Box::pin(async move {
                    let Some(c) = candidate else { return };
                    match c.to_json() {
                        Ok(init) => candidates.lock().await.push(IceCandidate::from(init)),
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Could not serialize local ICE candidate")
                        }
                    }
                })
            }));
    }
}

fn watch_channel(
    dc: Arc<RTCDataChannel>,
    label: String,
    channels: Arc<RwLock<HashMap<ChannelKind, Arc<RTCDataChannel>>>>,
    events: mpsc::Sender<PeerEvent>,
) {
    let opened: Weak<RTCDataChannel> = Arc::downgrade(&dc);
    let open_label = label.clone();
    let open_tx = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            if let (Some(kind), Some(dc)) = (ChannelKind::from_label(&open_label), opened.upgrade()) {
                channels.write().await.insert(kind, dc);
            }
            let _ = open_tx.send(PeerEvent::ChannelOpened(open_label)).await;
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let label = label.clone();
        let tx = events.clone();
        Box::pin(async move {
            let _ = tx
                .send(PeerEvent::MessageReceived {
                    label,
                    data: msg.data,
                })
                .await;
        })
    }));
}

impl fmt::Debug for WebRtcLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcLink")
            .field("peer", &self.peer)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn send(&self, channel: ChannelKind, payload: Bytes) -> Result<(), ForwardError> {
        let dc = self
            .channels
            .read()
            .await
            .get(&channel)
            .cloned()
            .ok_or(ForwardError::ChannelNotOpen(channel))?;

        dc.send(&payload)
            .await
            .map(|_| ())
            .map_err(|e| ForwardError::Transport(e.to_string()))
    }

    fn connection_state(&self) -> ConnectionState {
        map_state(self.pc.connection_state())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates.lock().await.clone()
    }

    async fn close(&self) {
        self.channels.write().await.clear();
        if let Err(e) = self.pc.close().await {
            tracing::warn!(peer = %self.peer, error = %e, "Error closing peer connection");
        }
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_m_line_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state(RTCPeerConnectionState::New), ConnectionState::New);
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert!(map_state(RTCPeerConnectionState::Disconnected).is_terminal());
        assert!(map_state(RTCPeerConnectionState::Failed).is_terminal());
        assert!(map_state(RTCPeerConnectionState::Closed).is_terminal());
    }

    #[test]
    fn test_candidate_conversion() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 40000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("frag".into()),
        };

        let init = RTCIceCandidateInit::from(candidate.clone());
        assert_eq!(init.sdp_mline_index, Some(0));
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[tokio::test]
    async fn test_rejects_non_offer() {
        let engine = WebRtcEngine::new(WebRtcSettings {
            ice_port_range: None,
            ..Default::default()
        })
        .unwrap();

        let result = engine
            .accept_offer(&PeerId::from("A"), SessionDescription::answer("v=0\r\n"))
            .await;
        assert!(matches!(result, Err(TransportError::InvalidOffer(_))));
    }

    #[tokio::test]
    async fn test_single_port_mode() {
        let engine = WebRtcEngine::new(WebRtcSettings {
            ice_mux_port: Some(0),
            // Ignored once a mux port is set
            ice_port_range: Some((40100, 40000)),
            ..Default::default()
        });
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn test_single_port_in_use() {
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = WebRtcEngine::new(WebRtcSettings {
            ice_mux_port: Some(port),
            ..Default::default()
        });
        assert!(matches!(result, Err(TransportError::Engine(_))));
    }

    #[test]
    fn test_rejects_inverted_port_range() {
        let result = WebRtcEngine::new(WebRtcSettings {
            ice_port_range: Some((40100, 40000)),
            ..Default::default()
        });
        assert!(matches!(result, Err(TransportError::Engine(_))));
    }
}
