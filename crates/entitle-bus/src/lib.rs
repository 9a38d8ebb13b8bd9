//! ---
//! ent_section: "02-messaging-ipc-data-model"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Reload-license command transport and broadcaster."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Cross-instance command channel for license reloads.
//!
//! Delivery is at-most-once with no ordering: a receiver that misses a command
//! catches up on the next one, because every command means "reconcile with the
//! latest stored certificate".

pub mod broadcaster;
pub mod transport;
pub mod types;

/// Shared result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised by bus transports and the broadcaster.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The transport has no live channel left.
    #[error("bus channel closed")]
    Closed,
    /// Publishing did not complete within the configured timeout.
    #[error("bus publish timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use broadcaster::{BroadcastMetrics, ReloadBroadcaster, ReloadHandler};
pub use transport::{CommandBus, InMemoryBus, Received, Subscription};
pub use types::{BusCommand, Envelope};
