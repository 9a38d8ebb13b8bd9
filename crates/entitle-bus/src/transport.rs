//! ---
//! ent_section: "02-messaging-ipc-data-model"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Reload-license command transport and broadcaster."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{BusError, Envelope, Result};

const DEFAULT_CAPACITY: usize = 64;

/// Transport abstraction used by the broadcaster.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Hand an envelope to the transport. Does not wait for receivers.
    async fn publish(&self, envelope: &Envelope) -> Result<()>;
    /// Open a new subscription that observes envelopes published from now on.
    fn subscribe(&self) -> Subscription;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Outcome of polling a [`Subscription`].
#[derive(Debug)]
pub enum Received {
    /// A decoded envelope.
    Envelope(Envelope),
    /// The subscriber fell behind and `0` frames were discarded.
    Lagged(u64),
}

/// Stream of JSON frames coming off a bus.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<str>>,
}

impl Subscription {
    /// Wrap a raw frame receiver, for transports bridging an external broker.
    pub fn from_receiver(receiver: broadcast::Receiver<Arc<str>>) -> Self {
        Self { receiver }
    }

    /// Wait for the next frame. Returns [`BusError::Closed`] once every
    /// publisher is gone.
    pub async fn recv(&mut self) -> Result<Received> {
        match self.receiver.recv().await {
            Ok(frame) => Ok(Received::Envelope(Envelope::decode(&frame)?)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Ok(Received::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed),
        }
    }
}

/// In-process bus backed by a tokio broadcast channel.
///
/// Clones share the channel, so several managers in one process (or test)
/// can exchange commands as if they were separate instances.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    sender: broadcast::Sender<Arc<str>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryBus {
    /// Create a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus retaining at most `capacity` undelivered frames per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl CommandBus for InMemoryBus {
    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let frame: Arc<str> = envelope.encode()?.into();
        // no subscribers is not an error: delivery is best effort
        if self.sender.send(frame).is_err() {
            debug!(command = envelope.command.as_str(), "published with no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        Subscription::from_receiver(self.sender.subscribe())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BusCommand;

    #[tokio::test]
    async fn subscribers_receive_published_envelopes() {
        let bus = InMemoryBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.clone().subscribe();

        let envelope = Envelope::new("main-1", BusCommand::ReloadLicense);
        bus.publish(&envelope).await.unwrap();

        for sub in [&mut first, &mut second] {
            match sub.recv().await.unwrap() {
                Received::Envelope(received) => assert_eq!(received, envelope),
                Received::Lagged(_) => panic!("unexpected lag"),
            }
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let bus = InMemoryBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(&Envelope::new("main-1", BusCommand::ReloadLicense))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = InMemoryBus::with_capacity(1);
        let mut sub = bus.subscribe();
        for _ in 0..3 {
            bus.publish(&Envelope::new("main-1", BusCommand::ReloadLicense))
                .await
                .unwrap();
        }
        assert!(matches!(sub.recv().await.unwrap(), Received::Lagged(2)));
    }
}
