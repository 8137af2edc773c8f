//! Per-peer channel router
//!
//! One task per negotiated peer consumes that peer's transport events in
//! order and turns them into coordinator commands or relays:
//!
//! | role     | channel | action                                  |
//! |----------|---------|-----------------------------------------|
//! | client   | meta    | control requests, ready signal          |
//! | client   | control | forward verbatim to the car             |
//! | producer | frame   | fan out verbatim to every client        |
//! | any      | other   | logged and dropped                      |

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{ChannelKind, ControlRequestKind, Envelope};
use crate::registry::{PeerId, Role};
use crate::relay::{deliver, deliver_one, DeliveryReport};
use crate::transport::{ConnectionState, PeerEvent};

use super::coordinator::{Command, ControlRoute, Origin};
use super::handle::SessionHandle;

pub(crate) fn spawn(
    handle: SessionHandle,
    peer: PeerId,
    session_id: u64,
    role: Role,
    events: mpsc::Receiver<PeerEvent>,
) -> JoinHandle<()> {
    let router = ChannelRouter {
        handle,
        origin: Origin {
            id: peer,
            session: Some(session_id),
        },
        role,
    };
    tokio::spawn(router.run(events))
}

struct ChannelRouter {
    handle: SessionHandle,
    origin: Origin,
    role: Role,
}

impl ChannelRouter {
    fn peer(&self) -> &PeerId {
        &self.origin.id
    }

    async fn run(self, mut events: mpsc::Receiver<PeerEvent>) {
        let mut ended = false;

        while let Some(event) = events.recv().await {
            let result = match event {
                PeerEvent::StateChanged(state) => {
                    ended = state.is_terminal();
                    self.on_state_changed(state).await
                }
                PeerEvent::ChannelOpened(label) => self.on_channel_opened(&label).await,
                PeerEvent::MessageReceived { label, data } => self.on_message(&label, data).await,
            };

            match result {
                Err(Error::SessionClosed) => return,
                Err(e) => {
                    tracing::debug!(peer = %self.peer(), error = %e, "Event handler returned error")
                }
                Ok(()) => {}
            }

            if ended {
                break;
            }
        }

        // Transport dropped its event stream without a terminal state
        if !ended {
            let _ = self.on_state_changed(ConnectionState::Closed).await;
        }
        tracing::debug!(peer = %self.peer(), "Channel router stopped");
    }

    async fn on_state_changed(&self, state: ConnectionState) -> Result<()> {
        self.handle
            .post_from(Command::StateChanged {
                origin: self.origin.clone(),
                state,
            })
            .await
    }

    async fn on_channel_opened(&self, label: &str) -> Result<()> {
        let Some(channel) = ChannelKind::from_label(label) else {
            tracing::warn!(peer = %self.peer(), role = %self.role, label, "Unknown data channel was opened");
            return Ok(());
        };

        self.handle
            .post_from(Command::ChannelOpened {
                origin: self.origin.clone(),
                channel,
            })
            .await
    }

    async fn on_message(&self, label: &str, data: Bytes) -> Result<()> {
        let Some(channel) = ChannelKind::from_label(label) else {
            tracing::warn!(peer = %self.peer(), label, "Message on unknown data channel");
            return Ok(());
        };

        match (self.role, channel) {
            (Role::Client, ChannelKind::Meta) => self.on_client_meta(&data).await,
            (Role::Client, ChannelKind::Control) => self.relay_control(data).await,
            (Role::Producer, ChannelKind::Frame) => self.relay_frame(data).await.map(|_| ()),
            (role, channel) => {
                tracing::debug!(peer = %self.peer(), role = %role, channel = %channel, len = data.len(), "No handler for message, dropping");
                Ok(())
            }
        }
    }

    async fn on_client_meta(&self, data: &[u8]) -> Result<()> {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(peer = %self.peer(), error = %e, "Could not parse incoming client meta message");
                return self.handle.unicast(self.peer().as_str(), Envelope::error(&e)).await;
            }
        };

        tracing::debug!(peer = %self.peer(), "Received meta message");

        let result = match envelope {
            Envelope::ControlRequest {
                kind: ControlRequestKind::TakeOver,
            } => self.handle.take_over(self.peer().as_str()).await,
            Envelope::ControlRequest {
                kind: ControlRequestKind::Release,
            } => self.handle.release(self.peer().as_str()).await,
            Envelope::Ready => {
                self.handle
                    .post_from(Command::Ready {
                        origin: self.origin.clone(),
                    })
                    .await
            }
            other => {
                tracing::warn!(peer = %self.peer(), message = ?other, "Meta message action is not supported");
                Ok(())
            }
        };

        match result {
            // Already reported to the client by the coordinator
            Err(Error::Arbitration(_)) => Ok(()),
            other => other,
        }
    }

    async fn relay_frame(&self, data: Bytes) -> Result<DeliveryReport> {
        let targets = self.handle.frame_targets(self.peer()).await?;
        tracing::debug!(len = data.len(), clients = targets.len(), "Forwarding car --> client frame data");

        let len = data.len();
        let report = deliver(
            targets,
            ChannelKind::Frame,
            data,
            self.handle.config().send_timeout,
        )
        .await;

        let stats = self.handle.relay_stats();
        stats.record_frame(len, report.delivered.len());
        stats.record_failures(report.failed.len());
        Ok(report)
    }

    async fn relay_control(&self, data: Bytes) -> Result<()> {
        match self.handle.control_route(self.peer()).await? {
            ControlRoute::Forward(car) => {
                tracing::debug!(peer = %self.peer(), len = data.len(), "Forwarding client --> car control data");

                let timeout = self.handle.config().send_timeout;
                match deliver_one(&car, ChannelKind::Control, data, timeout).await {
                    Ok(()) => self.handle.relay_stats().record_control(),
                    Err(e) => {
                        tracing::warn!(peer = %self.peer(), error = %e, "Could not forward control data");
                        self.handle.relay_stats().record_failures(1);
                        let report = Envelope::error(&e);
                        if let Err(Error::SessionClosed) =
                            self.handle.unicast(self.peer().as_str(), report).await
                        {
                            return Err(Error::SessionClosed);
                        }
                    }
                }
            }
            ControlRoute::NoProducer => {
                tracing::warn!(peer = %self.peer(), "Could not forward control data, car disconnected");
            }
            ControlRoute::NotPermitted => {
                tracing::debug!(peer = %self.peer(), "Dropping control data from client without control");
            }
            ControlRoute::UnknownSender => {
                tracing::debug!(peer = %self.peer(), "Dropping control data from removed client");
            }
        }
        Ok(())
    }
}
