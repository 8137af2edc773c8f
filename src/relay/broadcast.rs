//! Broadcast primitive

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;

use crate::protocol::ChannelKind;
use crate::registry::PeerId;
use crate::transport::{ForwardError, PeerLink};

/// A send target captured from the registry
#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: PeerId,
    pub link: Arc<dyn PeerLink>,
    /// Whether the target channel was open when the snapshot was taken
    pub open: bool,
}

/// Outcome of a fan-out
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, ForwardError)>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn failure_for(&self, id: &str) -> Option<&ForwardError> {
        self.failed
            .iter()
            .find(|(peer, _)| peer.as_str() == id)
            .map(|(_, e)| e)
    }
}

/// Send one payload to one recipient, bounded by `timeout`
pub async fn deliver_one(
    recipient: &Recipient,
    channel: ChannelKind,
    payload: Bytes,
    timeout: Duration,
) -> Result<(), ForwardError> {
    if !recipient.open {
        return Err(ForwardError::ChannelNotOpen(channel));
    }

    match tokio::time::timeout(timeout, recipient.link.send(channel, payload)).await {
        Ok(result) => result,
        Err(_) => Err(ForwardError::Timeout),
    }
}

/// Send `payload` to every recipient concurrently
///
/// Each send completes or fails independently. Failures are logged and
/// returned in the report.
pub async fn deliver(
    recipients: Vec<Recipient>,
    channel: ChannelKind,
    payload: Bytes,
    timeout: Duration,
) -> DeliveryReport {
    let sends = recipients.into_iter().map(|recipient| {
        let payload = payload.clone();
        async move {
            let result = deliver_one(&recipient, channel, payload, timeout).await;
            (recipient.id, result)
        }
    });

    let mut report = DeliveryReport::default();
    for (id, result) in join_all(sends).await {
        match result {
            Ok(()) => report.delivered.push(id),
            Err(e) => {
                tracing::warn!(peer = %id, channel = %channel, error = %e, "Delivery failed");
                report.failed.push((id, e));
            }
        }
    }

    report
}
