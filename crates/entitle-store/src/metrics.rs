//! ---
//! ent_section: "03-persistence-logging"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Persistence abstractions and storage bindings."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use prometheus::{IntCounterVec, Opts, Registry};
use tracing::warn;

use crate::{EntitlementStore, Result, UpsertOptions};

/// Metrics published by the store subsystem.
#[derive(Clone)]
pub struct StoreMetrics {
    upserts: IntCounterVec,
    upsert_failures: IntCounterVec,
}

impl StoreMetrics {
    /// Register all store metrics with the provided registry.
    pub fn new(registry: &Registry) -> Result<Self> {
        let upserts = IntCounterVec::new(
            Opts::new(
                "entitle_store_upserts_total",
                "Total number of settings successfully upserted",
            ),
            &["store", "key"],
        )?;
        registry.register(Box::new(upserts.clone()))?;

        let upsert_failures = IntCounterVec::new(
            Opts::new(
                "entitle_store_upsert_failures_total",
                "Total number of settings upserts that failed",
            ),
            &["store", "key"],
        )?;
        registry.register(Box::new(upsert_failures.clone()))?;

        Ok(Self {
            upserts,
            upsert_failures,
        })
    }

    /// Record a successful upsert.
    pub fn record_upsert(&self, store: &str, key: &str) {
        self.upserts.with_label_values(&[store, key]).inc();
    }

    /// Record a failed upsert.
    pub fn record_upsert_failure(&self, store: &str, key: &str) {
        self.upsert_failures.with_label_values(&[store, key]).inc();
    }

    /// Successful upserts recorded so far for `store`/`key`.
    pub fn upserts(&self, store: &str, key: &str) -> u64 {
        self.upserts.with_label_values(&[store, key]).get()
    }
}

impl std::fmt::Debug for StoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMetrics").finish_non_exhaustive()
    }
}

/// Store decorator that records upsert outcomes.
pub struct InstrumentedStore {
    inner: Arc<dyn EntitlementStore>,
    metrics: StoreMetrics,
}

impl InstrumentedStore {
    /// Wrap `inner` so every upsert is counted in `metrics`.
    pub fn new(inner: Arc<dyn EntitlementStore>, metrics: StoreMetrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl EntitlementStore for InstrumentedStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        self.inner.load(key).await
    }

    async fn upsert(&self, key: &str, value: &str, options: UpsertOptions) -> Result<()> {
        match self.inner.upsert(key, value, options).await {
            Ok(()) => {
                self.metrics.record_upsert(self.inner.name(), key);
                Ok(())
            }
            Err(err) => {
                self.metrics.record_upsert_failure(self.inner.name(), key);
                warn!(store = self.inner.name(), key, error = %err, "settings upsert failed");
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
