//! ---
//! ent_section: "02-messaging-ipc-data-model"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Reload-license command transport and broadcaster."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::Received;
use crate::{BusCommand, BusError, CommandBus, Envelope, Result};

/// Snapshot of broadcaster counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMetrics {
    /// Commands handed to the transport.
    pub sent: u64,
    /// Commands from other instances handed to the reload handler.
    pub received: u64,
    /// Commands lost to publish failures or subscriber lag.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BroadcastMetrics {
        BroadcastMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Receiver side of a reload command.
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    /// Reconcile local state with the latest stored certificate.
    async fn on_reload(&self);
}

/// Publishes and consumes the reload-license command for one instance.
pub struct ReloadBroadcaster {
    bus: Arc<dyn CommandBus>,
    instance_id: String,
    publish_timeout: Duration,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for ReloadBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadBroadcaster")
            .field("bus", &self.bus.name())
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl ReloadBroadcaster {
    /// Create a broadcaster publishing as `instance_id`.
    pub fn new(
        bus: Arc<dyn CommandBus>,
        instance_id: impl Into<String>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
            publish_timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Publish a reload command. Does not wait for any receiver.
    pub async fn publish(&self) -> Result<()> {
        let envelope = Envelope::new(self.instance_id.clone(), BusCommand::ReloadLicense);
        let outcome = match tokio::time::timeout(self.publish_timeout, self.bus.publish(&envelope)).await
        {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(self.publish_timeout)),
        };
        match outcome {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                debug!(
                    bus = self.bus.name(),
                    envelope_id = %envelope.id,
                    "reload-license published"
                );
                Ok(())
            }
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(bus = self.bus.name(), error = %err, "reload-license publish failed");
                Err(err)
            }
        }
    }

    /// Subscribe now and spawn a task feeding commands from other instances
    /// into `handler` until `shutdown` fires or the bus closes.
    pub fn spawn_listener(
        &self,
        handler: Arc<dyn ReloadHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let mut subscription = self.bus.subscribe();
        let instance_id = self.instance_id.clone();
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(instance = %instance_id, "reload listener stopping");
                        break;
                    }
                    received = subscription.recv() => match received {
                        Ok(Received::Envelope(envelope)) => {
                            if envelope.sender == instance_id {
                                continue;
                            }
                            counters.received.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                instance = %instance_id,
                                sender = %envelope.sender,
                                "reload-license received"
                            );
                            handler.on_reload().await;
                        }
                        Ok(Received::Lagged(skipped)) => {
                            counters.dropped.fetch_add(skipped, Ordering::Relaxed);
                            warn!(instance = %instance_id, skipped, "reload listener lagged; reconciling once");
                            handler.on_reload().await;
                        }
                        Err(BusError::Closed) => {
                            info!(instance = %instance_id, "bus closed; reload listener exiting");
                            break;
                        }
                        Err(err) => {
                            warn!(instance = %instance_id, error = %err, "discarding malformed bus frame");
                        }
                    }
                }
            }
        })
    }

    /// Return the current metrics snapshot.
    pub fn metrics(&self) -> BroadcastMetrics {
        self.counters.snapshot()
    }

    /// Instance id stamped on published envelopes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
