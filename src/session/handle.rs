//! Cloneable handle to the session coordinator

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{ChannelKind, Envelope};
use crate::registry::{PeerEntry, PeerId, Role};
use crate::relay::{DeliveryReport, Recipient};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::transport::{ConnectionState, PeerEvent};

use super::config::SessionConfig;
use super::coordinator::{Command, ControlRoute, Coordinator, Origin, PeerView};
use super::router;

/// Handle to the session coordinator
///
/// Every method is safe to call concurrently from any task. Calls are
/// processed by the coordinator in the order they arrive.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    config: Arc<SessionConfig>,
    stats: Arc<RelayStats>,
}

impl SessionHandle {
    /// Start a coordinator task and return a handle to it
    pub fn spawn(config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let config = Arc::new(config);
        let stats = Arc::new(RelayStats::new());

        let coordinator = Coordinator::new(Arc::clone(&config), Arc::clone(&stats), tx.downgrade());
        tokio::spawn(coordinator.run(rx));

        Self {
            commands: tx,
            config,
            stats,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn relay_stats(&self) -> &RelayStats {
        &self.stats
    }

    async fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx)).await?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Register a peer. Returns the session id assigned to it.
    pub async fn add(&self, entry: PeerEntry) -> Result<u64> {
        Ok(self.request(|reply| Command::Add { entry, reply }).await??)
    }

    /// Look up a registered peer
    pub async fn get(&self, id: &str) -> Result<Option<PeerView>> {
        let id = PeerId::from(id);
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Remove a peer, release its session and notify the remaining peers
    ///
    /// Removing an unknown peer is a no-op. Returns whether the peer existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let id = PeerId::from(id);
        self.request(|reply| Command::Remove { id, reply }).await
    }

    /// Consistent snapshot of every registered peer
    pub async fn snapshot(&self) -> Result<Vec<PeerView>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Visit every registered peer once, over a snapshot
    pub async fn for_each<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&PeerView),
    {
        for peer in self.snapshot().await? {
            visit(&peer);
        }
        Ok(())
    }

    /// Request control on behalf of `id`
    pub async fn take_over(&self, id: &str) -> Result<()> {
        let id = PeerId::from(id);
        Ok(self.request(|reply| Command::TakeOver { id, reply }).await??)
    }

    /// Release control on behalf of `id`
    pub async fn release(&self, id: &str) -> Result<()> {
        let id = PeerId::from(id);
        Ok(self.request(|reply| Command::Release { id, reply }).await??)
    }

    /// The active controller, if any
    pub async fn active_controller(&self) -> Result<Option<PeerId>> {
        self.request(|reply| Command::ActiveController { reply }).await
    }

    /// Send an envelope to every registered peer
    pub async fn broadcast(&self, envelope: Envelope) -> Result<DeliveryReport> {
        self.request(|reply| Command::Broadcast { envelope, reply })
            .await
    }

    /// Send an envelope to one peer's meta channel
    pub async fn unicast(&self, id: &str, envelope: Envelope) -> Result<()> {
        let id = PeerId::from(id);
        self.request(|reply| Command::Unicast {
            id,
            envelope,
            reply,
        })
        .await?
    }

    /// Feed a transport connection state for `id`
    pub async fn state_changed(&self, id: &str, state: ConnectionState) -> Result<()> {
        self.post(Command::StateChanged {
            origin: Origin {
                id: PeerId::from(id),
                session: None,
            },
            state,
        })
        .await
    }

    /// Record that one of `id`'s channels is open
    pub async fn channel_opened(&self, id: &str, channel: ChannelKind) -> Result<()> {
        self.post(Command::ChannelOpened {
            origin: Origin {
                id: PeerId::from(id),
                session: None,
            },
            channel,
        })
        .await
    }

    /// Client signalled that its meta handlers are wired
    pub async fn ready(&self, id: &str) -> Result<()> {
        self.post(Command::Ready {
            origin: Origin {
                id: PeerId::from(id),
                session: None,
            },
        })
        .await
    }

    pub(crate) async fn post_from(&self, command: Command) -> Result<()> {
        self.post(command).await
    }

    pub(crate) async fn frame_targets(&self, from: &PeerId) -> Result<Vec<Recipient>> {
        let from = from.clone();
        self.request(|reply| Command::FrameTargets { from, reply })
            .await
    }

    pub(crate) async fn control_route(&self, from: &PeerId) -> Result<ControlRoute> {
        let from = from.clone();
        self.request(|reply| Command::ControlRoute { from, reply })
            .await
    }

    /// Route a negotiated peer's transport events into the session
    pub fn attach(
        &self,
        id: PeerId,
        session_id: u64,
        role: Role,
        events: mpsc::Receiver<PeerEvent>,
    ) -> JoinHandle<()> {
        router::spawn(self.clone(), id, session_id, role, events)
    }

    /// Remove every peer and stop the coordinator
    ///
    /// Returns the number of peers that were torn down.
    pub async fn shutdown(&self) -> Result<usize> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
