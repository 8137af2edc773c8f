//! Session coordinator
//!
//! A single task owns the [`PeerRegistry`] and the [`ControlArbiter`] and
//! processes commands one at a time. Lifecycle changes, arbitration and
//! notification broadcasts therefore never interleave, and no lock is held
//! across a send.
//!
//! Notifications are sent from inside the coordinator so their order is the
//! same for every recipient. Each send is concurrent and bounded by the
//! configured send timeout, which bounds how long one command can take.
//! Frame and control payloads are sent by the routers, outside this task.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ChannelKind, Envelope};
use crate::registry::{OpenChannels, PeerEntry, PeerId, PeerRegistry, RegistryError, Role};
use crate::relay::{deliver, deliver_one, DeliveryReport, Recipient};
use crate::stats::RelayStats;
use crate::transport::{ConnectionState, ForwardError, PeerLink};

use super::arbiter::{ArbitrationError, ControlArbiter};
use super::config::SessionConfig;
use super::state::{PeerPhase, Transition};

/// Upper bound on closing every session at shutdown
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Read-only view of a registered peer
#[derive(Debug, Clone)]
pub struct PeerView {
    pub id: PeerId,
    pub role: Role,
    pub session_id: u64,
    pub phase: PeerPhase,
    pub channels: OpenChannels,
    pub clock_offset: i64,
    pub link: Arc<dyn PeerLink>,
}

impl From<&PeerEntry> for PeerView {
    fn from(entry: &PeerEntry) -> Self {
        Self {
            id: entry.id.clone(),
            role: entry.role,
            session_id: entry.session_id,
            phase: entry.phase,
            channels: entry.channels,
            clock_offset: entry.clock_offset,
            link: Arc::clone(&entry.link),
        }
    }
}

/// Where a client's control bytes should go
#[derive(Debug)]
pub enum ControlRoute {
    /// Forward to the connected producer
    Forward(Recipient),
    /// No connected producer; clients have been told
    NoProducer,
    /// Sender does not hold control and a grant is required
    NotPermitted,
    /// Sender is no longer registered
    UnknownSender,
}

/// Identifies the session an event came from
///
/// Events tagged with a session that has since been replaced under the same
/// peer id are ignored.
#[derive(Debug, Clone)]
pub(crate) struct Origin {
    pub id: PeerId,
    pub session: Option<u64>,
}

pub(crate) enum Command {
    Add {
        entry: PeerEntry,
        reply: oneshot::Sender<Result<u64, RegistryError>>,
    },
    Remove {
        id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Get {
        id: PeerId,
        reply: oneshot::Sender<Option<PeerView>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PeerView>>,
    },
    StateChanged {
        origin: Origin,
        state: ConnectionState,
    },
    ChannelOpened {
        origin: Origin,
        channel: ChannelKind,
    },
    TakeOver {
        id: PeerId,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    Release {
        id: PeerId,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    Ready {
        origin: Origin,
    },
    ReadyFallback {
        origin: Origin,
    },
    Broadcast {
        envelope: Envelope,
        reply: oneshot::Sender<DeliveryReport>,
    },
    Unicast {
        id: PeerId,
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), crate::Error>>,
    },
    ActiveController {
        reply: oneshot::Sender<Option<PeerId>>,
    },
    FrameTargets {
        from: PeerId,
        reply: oneshot::Sender<Vec<Recipient>>,
    },
    ControlRoute {
        from: PeerId,
        reply: oneshot::Sender<ControlRoute>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) struct Coordinator {
    registry: PeerRegistry,
    arbiter: ControlArbiter,
    config: Arc<SessionConfig>,
    stats: Arc<RelayStats>,
    next_session_id: u64,
    /// Used by fallback timers; weak so the loop ends once every handle is gone
    commands: mpsc::WeakSender<Command>,
}

impl Coordinator {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        stats: Arc<RelayStats>,
        commands: mpsc::WeakSender<Command>,
    ) -> Self {
        Self {
            registry: PeerRegistry::new(),
            arbiter: ControlArbiter::new(),
            config,
            stats,
            next_session_id: 1,
            commands,
        }
    }

    /// Process commands until shutdown or until every handle is dropped
    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            if let Command::Shutdown { reply } = command {
                let removed = self.teardown().await;
                let _ = reply.send(removed);
                return;
            }
            self.handle(command).await;
        }

        if !self.registry.is_empty() {
            self.teardown().await;
        }
        tracing::debug!("Session coordinator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Add { entry, reply } => {
                let _ = reply.send(self.add(entry));
            }
            Command::Remove { id, reply } => {
                let removed = self.depart(id.as_str(), None).await;
                let _ = reply.send(removed);
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.registry.get(id.as_str()).map(PeerView::from));
            }
            Command::Snapshot { reply } => {
                let mut peers = Vec::with_capacity(self.registry.len());
                self.registry.for_each(|entry| peers.push(PeerView::from(entry)));
                let _ = reply.send(peers);
            }
            Command::StateChanged { origin, state } => {
                self.on_state_changed(origin, state).await;
            }
            Command::ChannelOpened { origin, channel } => {
                self.on_channel_opened(origin, channel);
            }
            Command::TakeOver { id, reply } => {
                let result = self.take_over(id).await;
                let _ = reply.send(result);
            }
            Command::Release { id, reply } => {
                let result = self.release(id).await;
                let _ = reply.send(result);
            }
            Command::Ready { origin } => {
                self.on_ready(origin).await;
            }
            Command::ReadyFallback { origin } => {
                self.on_ready_fallback(origin).await;
            }
            Command::Broadcast { envelope, reply } => {
                let report = self.broadcast(&envelope).await;
                let _ = reply.send(report);
            }
            Command::Unicast {
                id,
                envelope,
                reply,
            } => {
                let result = self.unicast(id.as_str(), &envelope).await;
                let _ = reply.send(result);
            }
            Command::ActiveController { reply } => {
                let _ = reply.send(self.arbiter.active().cloned());
            }
            Command::FrameTargets { from, reply } => {
                let targets = if self.registry.contains(from.as_str()) {
                    self.registry
                        .recipients(ChannelKind::Frame, |entry| !entry.is_producer())
                } else {
                    Vec::new()
                };
                let _ = reply.send(targets);
            }
            Command::ControlRoute { from, reply } => {
                let route = self.control_route(from.as_str()).await;
                let _ = reply.send(route);
            }
            Command::Shutdown { .. } => unreachable!("shutdown is handled by the run loop"),
        }
    }

    fn add(&mut self, mut entry: PeerEntry) -> Result<u64, RegistryError> {
        let session_id = self.next_session_id;
        entry.session_id = session_id;
        self.registry.add(entry)?;
        self.next_session_id += 1;
        Ok(session_id)
    }

    /// Whether an event from `origin` still refers to the registered session
    fn is_current(&self, origin: &Origin) -> bool {
        match (self.registry.get(origin.id.as_str()), origin.session) {
            (Some(entry), Some(session)) => entry.session_id == session,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    async fn on_state_changed(&mut self, origin: Origin, state: ConnectionState) {
        if !self.is_current(&origin) {
            tracing::debug!(peer = %origin.id, state = %state, "State change for unknown or replaced session");
            return;
        }
        let Some(entry) = self.registry.get_mut(origin.id.as_str()) else {
            return;
        };

        let role = entry.role;
        let transition = entry.phase.advance(state);
        tracing::debug!(peer = %origin.id, role = %role, state = %state, "Connection state changed");

        match transition {
            Transition::Connected => self.on_connected(&origin, role).await,
            Transition::Gone => {
                self.depart(origin.id.as_str(), Some(state)).await;
            }
            Transition::Connecting | Transition::Unchanged => {}
        }
    }

    async fn on_connected(&mut self, origin: &Origin, role: Role) {
        match role {
            Role::Producer => {
                let Some(producer) = self.registry.producer() else {
                    return;
                };
                tracing::info!(peer = %origin.id, clock_offset = producer.clock_offset, "Car connected");

                let notification = Envelope::producer_state(true, producer.clock_offset);
                let targets = self
                    .registry
                    .recipients(ChannelKind::Meta, |entry| !entry.is_producer());
                self.send_notification(targets, &notification).await;
            }
            Role::Client => {
                tracing::info!(peer = %origin.id, "Client connected");
                if let Some(delay) = self.config.ready_fallback {
                    self.schedule_ready_fallback(origin.clone(), delay);
                }
            }
        }
    }

    /// Tell a freshly connected client about the car after `delay`, unless it
    /// has gone by then.
    fn schedule_ready_fallback(&self, origin: Origin, delay: Duration) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::ReadyFallback { origin }).await;
            }
        });
    }

    fn on_channel_opened(&mut self, origin: Origin, channel: ChannelKind) {
        if !self.is_current(&origin) {
            return;
        }
        if let Some(entry) = self.registry.get_mut(origin.id.as_str()) {
            if entry.channels.open(channel) {
                tracing::info!(peer = %origin.id, role = %entry.role, channel = %channel, "Data channel opened");
            }
        }
    }

    /// Remove a peer, release its session and notify the others
    ///
    /// Returns false if the peer was not registered.
    async fn depart(&mut self, id: &str, state: Option<ConnectionState>) -> bool {
        let Some(entry) = self.registry.remove(id) else {
            return false;
        };

        match state {
            Some(state) => {
                tracing::info!(peer = %entry.id, role = %entry.role, state = %state, "Peer left")
            }
            None => tracing::info!(peer = %entry.id, role = %entry.role, "Peer removed"),
        }

        let link = Arc::clone(&entry.link);
        tokio::spawn(async move { link.close().await });

        if self.arbiter.forget(id) {
            tracing::info!(peer = %entry.id, "Active controller left, control released");
            self.stats.record_release();
            self.broadcast(&Envelope::controller_state("")).await;
        }

        if entry.is_producer() {
            self.broadcast(&Envelope::producer_state(false, entry.clock_offset))
                .await;
        }

        self.arbiter.assert_consistent(&self.registry);
        true
    }

    async fn take_over(&mut self, id: PeerId) -> Result<(), ArbitrationError> {
        match self.arbiter.take_over(id.as_str(), &self.registry) {
            Ok(()) => {
                self.arbiter.assert_consistent(&self.registry);
                tracing::info!(peer = %id, "Control granted");
                self.stats.record_grant();
                self.broadcast(&Envelope::controller_state(id.as_str())).await;
                Ok(())
            }
            Err(e) => {
                tracing::info!(peer = %id, error = %e, "Control takeover rejected");
                let _ = self.unicast(id.as_str(), &Envelope::error(&e)).await;
                Err(e)
            }
        }
    }

    async fn release(&mut self, id: PeerId) -> Result<(), ArbitrationError> {
        match self.arbiter.release(id.as_str(), &self.registry) {
            Ok(()) => {
                tracing::info!(peer = %id, "Control released");
                self.stats.record_release();
                self.broadcast(&Envelope::controller_state("")).await;
                Ok(())
            }
            Err(e) => {
                tracing::info!(peer = %id, error = %e, "Control release rejected");
                let _ = self.unicast(id.as_str(), &Envelope::error(&e)).await;
                Err(e)
            }
        }
    }

    /// Explicit readiness: send the client the current car and controller state
    async fn on_ready(&mut self, origin: Origin) {
        if !self.is_current(&origin) {
            return;
        }
        let id = origin.id.as_str();

        let producer_state = match self.registry.producer() {
            Some(producer) => Envelope::producer_state(producer.is_live(), producer.clock_offset),
            None => Envelope::producer_state(false, 0),
        };
        let _ = self.unicast(id, &producer_state).await;

        if let Some(active) = self.arbiter.active() {
            let controller_state = Envelope::controller_state(active.as_str());
            let _ = self.unicast(id, &controller_state).await;
        }
    }

    async fn on_ready_fallback(&mut self, origin: Origin) {
        if !self.is_current(&origin) {
            return;
        }
        let Some(producer) = self.registry.producer() else {
            return;
        };

        tracing::info!(peer = %origin.id, "Notifying client of connected car");
        let notification = Envelope::producer_state(producer.is_live(), producer.clock_offset);
        let _ = self.unicast(origin.id.as_str(), &notification).await;
    }

    async fn control_route(&mut self, from: &str) -> ControlRoute {
        if !self.registry.contains(from) {
            return ControlRoute::UnknownSender;
        }
        if self.config.require_control_grant && !self.arbiter.is_controller(from) {
            return ControlRoute::NotPermitted;
        }

        match self.registry.producer() {
            Some(producer) if producer.is_live() => {
                ControlRoute::Forward(producer.recipient(ChannelKind::Control))
            }
            producer => {
                let clock_offset = producer.map(|p| p.clock_offset).unwrap_or(0);
                self.broadcast(&Envelope::producer_state(false, clock_offset))
                    .await;
                ControlRoute::NoProducer
            }
        }
    }

    /// Send to every registered peer
    async fn broadcast(&self, envelope: &Envelope) -> DeliveryReport {
        let targets = self.registry.recipients(ChannelKind::Meta, |_| true);
        self.send_notification(targets, envelope).await
    }

    async fn send_notification(
        &self,
        targets: Vec<Recipient>,
        envelope: &Envelope,
    ) -> DeliveryReport {
        let report = deliver(
            targets,
            ChannelKind::Meta,
            envelope.encode(),
            self.config.send_timeout,
        )
        .await;
        self.stats.record_failures(report.failed.len());
        report
    }

    async fn unicast(&self, id: &str, envelope: &Envelope) -> Result<(), crate::Error> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(PeerId::from(id)))?;

        let result = deliver_one(
            &entry.recipient(ChannelKind::Meta),
            ChannelKind::Meta,
            envelope.encode(),
            self.config.send_timeout,
        )
        .await;

        if let Err(e) = &result {
            tracing::warn!(peer = id, error = %e, "Could not send meta message");
            self.stats.record_failures(1);
        }
        result.map_err(|e: ForwardError| e.into())
    }

    /// Remove every peer and release its session, without notifications
    async fn teardown(&mut self) -> usize {
        self.arbiter.reset();
        let entries = self.registry.drain();
        let count = entries.len();

        let closes = entries.into_iter().map(|entry| async move {
            entry.link.close().await;
            tracing::debug!(peer = %entry.id, "Session closed");
        });
        if tokio::time::timeout(TEARDOWN_GRACE, join_all(closes))
            .await
            .is_err()
        {
            tracing::warn!("Timed out closing peer sessions");
        }

        tracing::info!(peers = count, "Destroyed session state");
        count
    }
}
