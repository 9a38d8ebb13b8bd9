//! ---
//! ent_section: "03-persistence-logging"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Persistence abstractions and storage bindings."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Keyed settings persistence for license certificates.
//!
//! The only write path is an idempotent upsert; there is no delete.

use async_trait::async_trait;

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for the store subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Wrapper for IO errors encountered while reading/writing the settings file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when the settings file fails integrity verification.
    #[error("settings hash mismatch")]
    HashMismatch,
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Options accepted by [`EntitlementStore::upsert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Whether the application should load the setting eagerly at startup.
    pub load_on_startup: bool,
}

/// Durable key/value storage for serialized certificates.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<String>>;
    /// Insert or replace the value stored under `key`.
    async fn upsert(&self, key: &str, value: &str, options: UpsertOptions) -> Result<()>;
    /// Human-readable adapter name for logging/metrics.
    fn name(&self) -> &'static str;
}

pub mod file;
pub mod memory;
pub mod metrics;

pub use file::FileSettingsStore;
pub use memory::InMemorySettingsStore;
pub use metrics::{InstrumentedStore, StoreMetrics};
