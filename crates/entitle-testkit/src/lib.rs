//! ---
//! ent_section: "15-testing-qa-runbook"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Shared fakes and certificate fixtures for test suites."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
//! Test doubles for the license server, bus, store, and usage collector, plus
//! a deterministic signing key for issuing certificates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use entitle_bus::{CommandBus, Envelope, InMemoryBus, Subscription};
use entitle_common::config::{AppConfig, ConfiguredRole, ExecutionMode, ProcessKind};
use entitle_core::{ActivationRequest, LicenseServer, RenewalRequest, UsageMetric, UsageMetricsSource};
use entitle_licensing::{
    encode_certificate, CertificatePayload, CertificateVerifier, EntitlementValue, LicenseError,
    Result,
};
use entitle_store::{EntitlementStore, InMemorySettingsStore, UpsertOptions};
use parking_lot::Mutex;

/// Seed of the key every fixture certificate is signed with.
pub const TEST_SEED: [u8; 32] = [7u8; 32];

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&TEST_SEED)
}

/// Verifier accepting certificates signed by [`signing_key`].
pub fn verifier() -> CertificateVerifier {
    CertificateVerifier::with_public_key(signing_key().verifying_key().to_bytes())
}

/// Sign `payload` with the test key.
pub fn issue(payload: &CertificatePayload) -> String {
    encode_certificate(&signing_key(), payload).expect("fixture certificate encodes")
}

/// Configuration for one simulated instance.
pub fn instance_config(
    id: &str,
    multi_main: bool,
    role: ConfiguredRole,
    mode: ExecutionMode,
) -> AppConfig {
    let mut config = AppConfig::default();
    config.instance.id = id.to_owned();
    config.instance.process = ProcessKind::Main;
    config.instance.role = role;
    config.multi_main.enabled = multi_main;
    config.executions.mode = mode;
    config.license.request_timeout = Duration::from_secs(2);
    config
}

/// License server double that issues freshly signed certificates.
pub struct FakeLicenseServer {
    consumer_id: String,
    plan: Mutex<String>,
    validity: Mutex<chrono::Duration>,
    grants: Mutex<BTreeMap<String, EntitlementValue>>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    activations: AtomicUsize,
    renewals: AtomicUsize,
    last_renewal: Mutex<Option<RenewalRequest>>,
    last_activation: Mutex<Option<ActivationRequest>>,
}

impl Default for FakeLicenseServer {
    fn default() -> Self {
        Self::new("consumer-1", "enterprise")
    }
}

impl FakeLicenseServer {
    pub fn new(consumer_id: &str, plan: &str) -> Self {
        Self {
            consumer_id: consumer_id.to_owned(),
            plan: Mutex::new(plan.to_owned()),
            validity: Mutex::new(chrono::Duration::days(30)),
            grants: Mutex::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            activations: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            last_renewal: Mutex::new(None),
            last_activation: Mutex::new(None),
        }
    }

    pub fn grant_flag(&self, key: &str, enabled: bool) -> &Self {
        self.grants
            .lock()
            .insert(key.to_owned(), EntitlementValue::Flag(enabled));
        self
    }

    pub fn grant_quota(&self, key: &str, limit: i64) -> &Self {
        self.grants
            .lock()
            .insert(key.to_owned(), EntitlementValue::Quota(limit));
        self
    }

    pub fn revoke(&self, key: &str) -> &Self {
        self.grants.lock().remove(key);
        self
    }

    pub fn set_plan(&self, plan: &str) {
        *self.plan.lock() = plan.to_owned();
    }

    pub fn set_validity(&self, validity: chrono::Duration) {
        *self.validity.lock() = validity;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn activation_calls(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn renewal_calls(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn last_renewal(&self) -> Option<RenewalRequest> {
        self.last_renewal.lock().clone()
    }

    pub fn last_activation(&self) -> Option<ActivationRequest> {
        self.last_activation.lock().clone()
    }

    /// Certificate the server would hand out right now.
    pub fn current_certificate(&self) -> String {
        let mut payload = CertificatePayload::new(
            self.consumer_id.clone(),
            self.plan.lock().clone(),
            *self.validity.lock(),
        );
        payload.entitlements = self.grants.lock().clone();
        issue(&payload)
    }

    async fn answer(&self) -> Result<String> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LicenseError::LicenseServer("fake server unavailable".to_owned()));
        }
        Ok(self.current_certificate())
    }
}

#[async_trait]
impl LicenseServer for FakeLicenseServer {
    async fn activate(&self, request: &ActivationRequest) -> Result<String> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        *self.last_activation.lock() = Some(request.clone());
        self.answer().await
    }

    async fn renew(&self, request: &RenewalRequest) -> Result<String> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        *self.last_renewal.lock() = Some(request.clone());
        self.answer().await
    }

    fn endpoint(&self) -> &str {
        "fake://license"
    }
}

/// Bus wrapper counting what this instance publishes.
#[derive(Debug, Default)]
pub struct CountingBus {
    inner: InMemoryBus,
    published: AtomicUsize,
}

impl CountingBus {
    /// Attach to a shared in-memory bus.
    pub fn attach(inner: &InMemoryBus) -> Self {
        Self {
            inner: inner.clone(),
            published: AtomicUsize::new(0),
        }
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandBus for CountingBus {
    async fn publish(&self, envelope: &Envelope) -> entitle_bus::Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);
        self.inner.publish(envelope).await
    }

    fn subscribe(&self) -> Subscription {
        self.inner.subscribe()
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Usage collector reporting a fixed user count.
#[derive(Debug, Default)]
pub struct FixedUsage {
    pub users: i64,
    calls: AtomicUsize,
}

impl FixedUsage {
    pub fn new(users: i64) -> Self {
        Self {
            users,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageMetricsSource for FixedUsage {
    async fn collect_usage_metrics(&self) -> Vec<UsageMetric> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        vec![UsageMetric::new("users", self.users)]
    }

    async fn collect_passthrough_data(&self) -> serde_json::Value {
        serde_json::json!({ "source": "testkit" })
    }
}

/// Per-instance view of a shared store that counts this instance's writes.
#[derive(Debug, Clone)]
pub struct CountingStore {
    inner: InMemorySettingsStore,
    upserts: Arc<AtomicUsize>,
}

impl CountingStore {
    pub fn attach(inner: &InMemorySettingsStore) -> Self {
        Self {
            inner: inner.clone(),
            upserts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntitlementStore for CountingStore {
    async fn load(&self, key: &str) -> entitle_store::Result<Option<String>> {
        self.inner.load(key).await
    }

    async fn upsert(&self, key: &str, value: &str, options: UpsertOptions) -> entitle_store::Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(key, value, options).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}
