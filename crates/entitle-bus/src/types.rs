//! ---
//! ent_section: "02-messaging-ipc-data-model"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Reload-license command transport and broadcaster."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands carried on the bus. The reload command has no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusCommand {
    /// Re-derive entitlement state from the latest stored certificate.
    ReloadLicense,
}

impl BusCommand {
    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            BusCommand::ReloadLicense => "reload-license",
        }
    }
}

/// Message envelope published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier for tracing.
    pub id: Uuid,
    /// Instance id of the publisher.
    pub sender: String,
    /// Timestamp when the envelope was created.
    pub timestamp: DateTime<Utc>,
    /// Command carried by the envelope.
    pub command: BusCommand,
}

impl Envelope {
    /// Construct a new envelope for `command` published by `sender`.
    pub fn new(sender: impl Into<String>, command: BusCommand) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            timestamp: Utc::now(),
            command,
        }
    }

    /// Encode the envelope as a JSON frame.
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON frame.
    pub fn decode(frame: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}
