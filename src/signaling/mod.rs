//! Offer/answer and candidate exchange
//!
//! Signaling is the only place peers enter the relay. An accepted offer
//! produces a registry entry plus a channel router for the new session;
//! candidate exchange trickles remote candidates in and hands back the local
//! ones gathered so far.

pub mod http;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::{PeerEntry, PeerId, Role};
use crate::session::SessionHandle;
use crate::transport::{IceCandidate, SessionDescription, TransportEngine, TransportError};

/// Error type for signaling requests
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    /// Malformed offer, candidate or peer identity
    #[error("invalid request: {0}")]
    Validation(String),

    /// No session registered under this identity
    #[error("no connection registered for peer {0}")]
    NotFound(PeerId),
}

/// Body of an offer submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferRequest {
    /// Peer identity. Ignored for the car, which always registers under the
    /// configured producer id.
    #[serde(default)]
    pub id: String,

    pub offer: SessionDescription,

    /// Sender's clock at registration, Unix milliseconds
    #[serde(default)]
    pub timestamp: i64,
}

/// Body of a candidate submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRequest {
    #[serde(default)]
    pub id: String,

    pub candidate: IceCandidate,
}

/// Current time in Unix milliseconds
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Signaling front end over a session and a transport engine
#[derive(Clone)]
pub struct Signaling {
    session: SessionHandle,
    engine: Arc<dyn TransportEngine>,
}

impl Signaling {
    pub fn new(session: SessionHandle, engine: Arc<dyn TransportEngine>) -> Self {
        Self { session, engine }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Identity a request from `role` is registered under
    fn identity(&self, role: Role, requested: &str) -> Result<PeerId> {
        let producer_id = &self.session.config().producer_id;
        match role {
            Role::Producer => Ok(producer_id.clone()),
            Role::Client => {
                let id = requested.trim();
                if id.is_empty() {
                    return Err(SignalingError::Validation("missing peer id".into()).into());
                }
                if id == producer_id.as_str() {
                    return Err(SignalingError::Validation(format!(
                        "peer id {id} is reserved for the car"
                    ))
                    .into());
                }
                Ok(PeerId::from(id))
            }
        }
    }

    /// Accept an offer and register the resulting session
    ///
    /// `received_at` is the local receipt time in Unix milliseconds. For the
    /// car, the difference to the offer's timestamp becomes its clock offset.
    pub async fn submit_offer(
        &self,
        role: Role,
        request: OfferRequest,
        received_at: i64,
    ) -> Result<SessionDescription> {
        let id = self.identity(role, &request.id)?;
        if request.offer.sdp.trim().is_empty() {
            return Err(SignalingError::Validation("offer has no sdp".into()).into());
        }

        let clock_offset = match role {
            Role::Producer => request
                .timestamp
                .checked_sub(received_at)
                .ok_or_else(|| SignalingError::Validation("timestamp out of range".into()))?,
            Role::Client => 0,
        };

        let negotiated = self
            .engine
            .accept_offer(&id, request.offer)
            .await
            .map_err(|e| match e {
                TransportError::InvalidOffer(reason) => {
                    Error::from(SignalingError::Validation(reason))
                }
                other => Error::from(other),
            })?;

        let entry = PeerEntry::new(id.clone(), role, Arc::clone(&negotiated.link))
            .with_clock_offset(clock_offset);
        let session_id = match self.session.add(entry).await {
            Ok(session_id) => session_id,
            Err(e) => {
                tracing::warn!(peer = %id, role = %role, error = %e, "Could not register peer");
                negotiated.link.close().await;
                return Err(e);
            }
        };

        tracing::info!(peer = %id, role = %role, clock_offset, "Accepted offer");
        self.session.attach(id, session_id, role, negotiated.events);
        Ok(negotiated.answer)
    }

    /// Add a remote candidate and return every local candidate gathered so far
    pub async fn submit_candidate(
        &self,
        role: Role,
        request: CandidateRequest,
    ) -> Result<Vec<IceCandidate>> {
        let id = match role {
            Role::Producer => self.session.config().producer_id.clone(),
            Role::Client => PeerId::from(request.id.trim()),
        };

        let peer = match self.session.get(id.as_str()).await? {
            Some(peer) if peer.role == role => peer,
            _ => return Err(SignalingError::NotFound(id).into()),
        };

        // An empty candidate marks the end of the remote candidates
        if !request.candidate.candidate.trim().is_empty() {
            peer.link
                .add_remote_candidate(request.candidate)
                .await
                .map_err(|e| match e {
                    TransportError::InvalidCandidate(reason) => {
                        Error::from(SignalingError::Validation(reason))
                    }
                    other => Error::from(other),
                })?;
            tracing::debug!(peer = %id, role = %role, "Added remote ICE candidate");
        }

        Ok(peer.link.local_candidates().await)
    }
}
