//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Entitlement manager and license server integration."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
//! Role-specific capabilities handed to the certificate client.
//!
//! [`LeaderHooks`] persist certificates and report usage. [`PassiveHooks`]
//! do neither and are used by followers and by non-primary processes, which
//! only consume state a leader already stored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use entitle_licensing::{LicenseError, Result};
use entitle_store::{EntitlementStore, UpsertOptions};
use tracing::debug;

use crate::server::UsageMetric;

/// Producer of the usage figures sent along with renewals.
#[async_trait]
pub trait UsageMetricsSource: Send + Sync {
    async fn collect_usage_metrics(&self) -> Vec<UsageMetric>;
    async fn collect_passthrough_data(&self) -> serde_json::Value;
}

/// Reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUsageMetrics;

#[async_trait]
impl UsageMetricsSource for NoUsageMetrics {
    async fn collect_usage_metrics(&self) -> Vec<UsageMetric> {
        Vec::new()
    }

    async fn collect_passthrough_data(&self) -> serde_json::Value {
        serde_json::Value::Object(serde_json::Map::new())
    }
}

/// Capability set wired into the certificate client.
#[async_trait]
pub trait CertificateHooks: Send + Sync {
    /// Store a certificate fetched from the license server.
    async fn persist(&self, raw: &str) -> Result<()>;
    /// Usage metrics and passthrough data for the next server call.
    async fn collect_usage(&self) -> (Vec<UsageMetric>, serde_json::Value);
    fn name(&self) -> &'static str;
}

pub struct LeaderHooks {
    store: Arc<dyn EntitlementStore>,
    cert_key: String,
    timeout: Duration,
    usage: Arc<dyn UsageMetricsSource>,
}

impl LeaderHooks {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        cert_key: impl Into<String>,
        timeout: Duration,
        usage: Arc<dyn UsageMetricsSource>,
    ) -> Self {
        Self {
            store,
            cert_key: cert_key.into(),
            timeout,
            usage,
        }
    }
}

#[async_trait]
impl CertificateHooks for LeaderHooks {
    async fn persist(&self, raw: &str) -> Result<()> {
        let options = UpsertOptions {
            load_on_startup: false,
        };
        match tokio::time::timeout(self.timeout, self.store.upsert(&self.cert_key, raw, options))
            .await
        {
            Ok(Ok(())) => {
                debug!(store = self.store.name(), key = %self.cert_key, "certificate persisted");
                Ok(())
            }
            Ok(Err(err)) => Err(LicenseError::Store(err.to_string())),
            Err(_) => Err(LicenseError::Store(format!(
                "upsert of '{}' timed out after {:?}",
                self.cert_key, self.timeout
            ))),
        }
    }

    async fn collect_usage(&self) -> (Vec<UsageMetric>, serde_json::Value) {
        let metrics = self.usage.collect_usage_metrics().await;
        let passthrough = self.usage.collect_passthrough_data().await;
        (metrics, passthrough)
    }

    fn name(&self) -> &'static str {
        "leader"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveHooks;

#[async_trait]
impl CertificateHooks for PassiveHooks {
    async fn persist(&self, _raw: &str) -> Result<()> {
        debug!("passive instance; certificate not persisted");
        Ok(())
    }

    async fn collect_usage(&self) -> (Vec<UsageMetric>, serde_json::Value) {
        (Vec::new(), serde_json::Value::Object(serde_json::Map::new()))
    }

    fn name(&self) -> &'static str {
        "passive"
    }
}
