//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Entitlement manager and license server integration."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use entitle_licensing::{
    CertificateVerifier, EntitlementSet, FeatureCatalog, LicenseError, Result, VerifiedCertificate,
};
use entitle_store::EntitlementStore;
use tracing::debug;

use crate::hooks::CertificateHooks;
use crate::server::{ActivationRequest, LicenseServer, RenewalRequest};

/// Settings fixed when the client is built.
#[derive(Debug, Clone)]
pub struct ClientPolicy {
    /// Persistence key of the certificate.
    pub cert_key: String,
    pub tenant_id: u32,
    /// Bound on every store and server call.
    pub timeout: Duration,
    /// Offline clients never contact the license server.
    pub offline: bool,
}

/// Loads, verifies, and fetches certificates on behalf of the manager.
pub struct CertificateClient {
    store: Arc<dyn EntitlementStore>,
    server: Arc<dyn LicenseServer>,
    verifier: CertificateVerifier,
    catalog: Arc<FeatureCatalog>,
    hooks: Arc<dyn CertificateHooks>,
    policy: ClientPolicy,
}

impl CertificateClient {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        server: Arc<dyn LicenseServer>,
        verifier: CertificateVerifier,
        catalog: Arc<FeatureCatalog>,
        hooks: Arc<dyn CertificateHooks>,
        policy: ClientPolicy,
    ) -> Self {
        Self {
            store,
            server,
            verifier,
            catalog,
            hooks,
            policy,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.policy.offline
    }

    /// Stored certificate, or `None` on first boot.
    pub async fn load(&self) -> Result<Option<String>> {
        let key = self.policy.cert_key.as_str();
        match tokio::time::timeout(self.policy.timeout, self.store.load(key)).await {
            Ok(Ok(value)) => Ok(value.filter(|raw| !raw.trim().is_empty())),
            Ok(Err(err)) => Err(LicenseError::Store(err.to_string())),
            Err(_) => Err(LicenseError::Store(format!(
                "load of '{key}' timed out after {:?}",
                self.policy.timeout
            ))),
        }
    }

    /// Verify `raw` and derive the entitlements it grants. Touches no state.
    pub fn validate_and_derive(&self, raw: &str) -> Result<(VerifiedCertificate, EntitlementSet)> {
        let certificate = self.verifier.verify(raw)?;
        let entitlements = EntitlementSet::derive(&certificate.payload, &self.catalog);
        Ok((certificate, entitlements))
    }

    /// Ask the license server for a replacement of `current`.
    pub async fn fetch_from_server(&self, current: &VerifiedCertificate) -> Result<String> {
        if self.policy.offline {
            return Err(LicenseError::OfflineMode("renewal"));
        }
        let (usage_metrics, passthrough) = self.hooks.collect_usage().await;
        let request = RenewalRequest {
            tenant_id: self.policy.tenant_id,
            consumer_id: current.payload.consumer_id.clone(),
            certificate: current.raw.clone(),
            usage_metrics,
            passthrough,
        };
        debug!(endpoint = self.server.endpoint(), consumer_id = %request.consumer_id, "renewing certificate");
        self.bounded(self.server.renew(&request)).await
    }

    /// Exchange an activation key for a certificate.
    pub async fn activate(&self, activation_key: &str) -> Result<String> {
        if self.policy.offline {
            return Err(LicenseError::OfflineMode("activation"));
        }
        let (usage_metrics, passthrough) = self.hooks.collect_usage().await;
        let request = ActivationRequest {
            tenant_id: self.policy.tenant_id,
            activation_key: activation_key.to_owned(),
            usage_metrics,
            passthrough,
        };
        debug!(endpoint = self.server.endpoint(), "activating license");
        self.bounded(self.server.activate(&request)).await
    }

    /// Persist a certificate through the role hooks.
    pub async fn persist(&self, raw: &str) -> Result<()> {
        self.hooks.persist(raw).await
    }

    async fn bounded<F>(&self, call: F) -> Result<String>
    where
        F: std::future::Future<Output = Result<String>>,
    {
        match tokio::time::timeout(self.policy.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LicenseError::LicenseServer(format!(
                "{} did not answer within {:?}",
                self.server.endpoint(),
                self.policy.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use ed25519_dalek::SigningKey;
    use entitle_licensing::catalog::features;
    use entitle_licensing::{encode_certificate, CertificatePayload};
    use entitle_store::InMemorySettingsStore;

    use super::*;
    use crate::hooks::PassiveHooks;

    struct SlowServer;

    #[async_trait]
    impl LicenseServer for SlowServer {
        async fn activate(&self, _request: &ActivationRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(String::new())
        }

        async fn renew(&self, _request: &RenewalRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(String::new())
        }

        fn endpoint(&self) -> &str {
            "slow"
        }
    }

    fn client(store: InMemorySettingsStore, offline: bool) -> CertificateClient {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        CertificateClient::new(
            Arc::new(store),
            Arc::new(SlowServer),
            CertificateVerifier::with_public_key(key.verifying_key().to_bytes()),
            Arc::new(FeatureCatalog::standard()),
            Arc::new(PassiveHooks),
            ClientPolicy {
                cert_key: "license-cert".into(),
                tenant_id: 1,
                timeout: Duration::from_millis(50),
                offline,
            },
        )
    }

    #[tokio::test]
    async fn load_returns_none_on_first_boot() {
        let client = client(InMemorySettingsStore::new(), false);
        assert_eq!(client.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn validate_and_derive_reads_entitlements() {
        let store = InMemorySettingsStore::new();
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let payload = CertificatePayload::new("c-1", "enterprise", ChronoDuration::days(3))
            .with_flag(features::SHARING, true);
        store.seed("license-cert", encode_certificate(&key, &payload).unwrap());

        let client = client(store, true);
        let raw = client.load().await.unwrap().expect("stored certificate");
        let (certificate, set) = client.validate_and_derive(&raw).unwrap();
        assert_eq!(certificate.payload.consumer_id, "c-1");
        assert!(set.flag(features::SHARING));
        assert!(client.validate_and_derive("garbage").is_err());
    }

    #[tokio::test]
    async fn offline_client_refuses_remote_calls() {
        let client = client(InMemorySettingsStore::new(), true);
        let err = client.activate("key").await.unwrap_err();
        assert_eq!(err, LicenseError::OfflineMode("activation"));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let client = client(InMemorySettingsStore::new(), false);
        let err = client.activate("key").await.unwrap_err();
        assert_eq!(err.kind(), "license_server");
    }
}
