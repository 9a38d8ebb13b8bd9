//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Entitlement manager and license server integration."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
//! The entitlement manager: lifecycle, queries, and certificate changes.
//!
//! Readers load an atomically swapped [`EntitlementSnapshot`] and never wait.
//! Activation and renewal share one gate, reloads have their own, and the
//! snapshot swap itself happens under a short lock that no I/O runs under.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use entitle_bus::{BroadcastMetrics, CommandBus, InMemoryBus, ReloadBroadcaster, ReloadHandler};
use entitle_common::config::{AppConfig, ExecutionMode, LicenseConfig};
use entitle_common::logging::{log_license_event, EventContext, EventOutcome};
use entitle_licensing::catalog::{features, quotas};
use entitle_licensing::logging::{
    record_invalid_license, record_license_load, record_reload_broadcast, record_renewal,
};
use entitle_licensing::{
    CertificateVerifier, EntitlementSet, FeatureCatalog, LicenseError, QuotaLimit, Result,
    VerifiedCertificate,
};
use entitle_roles::{InstanceRole, InstanceRoleResolver};
use entitle_store::{EntitlementStore, FileSettingsStore, InstrumentedStore, StoreMetrics};
use parking_lot::Mutex;
use prometheus::Registry;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{CertificateClient, ClientPolicy};
use crate::hooks::{CertificateHooks, LeaderHooks, NoUsageMetrics, PassiveHooks, UsageMetricsSource};
use crate::renewal::{self, RenewalPolicy};
use crate::server::{HttpLicenseServer, LicenseServer};

const COMMUNITY_PLAN: &str = "Community";
const UNKNOWN_CONSUMER: &str = "unknown";

/// Options accepted by [`EntitlementManager::initialize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Tear down and rebuild an already initialized manager.
    pub force_recreate: bool,
    /// Non-primary processes never contact the license server.
    pub is_primary_process: bool,
    /// Short-lived command line invocation.
    pub is_cli: bool,
}

/// What [`EntitlementManager::initialize`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized,
    /// No-op: already initialized and no recreate was requested.
    AlreadyInitialized,
    /// No-op: the manager was shut down.
    ShuttingDown,
}

/// Result of an activation, renewal, or reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshOutcome {
    /// A different certificate is now in effect.
    Changed,
    /// The certificate in effect is the same as before.
    Unchanged,
    /// Nothing stored yet.
    NoCertificate,
    /// The candidate certificate was unreadable, invalid, or superseded while
    /// it was read; the previous state stays.
    KeptPrevious,
}

/// Certificate in effect together with the entitlements derived from it.
#[derive(Debug, Clone, Default)]
pub struct EntitlementSnapshot {
    certificate: Option<VerifiedCertificate>,
    entitlements: EntitlementSet,
}

impl EntitlementSnapshot {
    pub fn certificate(&self) -> Option<&VerifiedCertificate> {
        self.certificate.as_ref()
    }

    pub fn entitlements(&self) -> &EntitlementSet {
        &self.entitlements
    }

    pub fn flag(&self, name: &str) -> bool {
        self.entitlements.flag(name)
    }

    pub fn quota(&self, name: &str) -> QuotaLimit {
        self.entitlements.quota(name)
    }
}

/// Product plan carried by the certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MainPlan {
    pub product_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

/// Serialisable summary of the license state.
#[derive(Debug, Clone, Serialize)]
pub struct LicenseInfo {
    pub plan_name: String,
    pub consumer_id: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub instance_id: String,
    pub role: InstanceRole,
    pub multi_main_withdrawn: bool,
    pub features: BTreeMap<String, bool>,
    pub quotas: BTreeMap<String, QuotaLimit>,
}

/// Numbered attempts of one kind of refresh. Callers queued behind the gate
/// reuse the outcome of a later-numbered attempt instead of starting their own.
#[derive(Default)]
struct Coalesced {
    started: AtomicU64,
    last: Mutex<Option<(u64, Result<RefreshOutcome>)>>,
}

impl Coalesced {
    /// Floor that an attempt still running when the caller arrived exceeds.
    fn in_flight_floor(&self) -> u64 {
        self.last.lock().as_ref().map_or(0, |(attempt, _)| *attempt)
    }

    /// Floor that only attempts started after the caller arrived exceed.
    fn fresh_floor(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Outcome of the latest finished attempt, if it is numbered above `floor`.
    fn joined(&self, floor: u64) -> Option<Result<RefreshOutcome>> {
        match self.last.lock().as_ref() {
            Some((attempt, outcome)) if *attempt > floor => Some(outcome.clone()),
            _ => None,
        }
    }

    fn begin(&self) -> u64 {
        self.started.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn finish(&self, attempt: u64, outcome: &Result<RefreshOutcome>) {
        *self.last.lock() = Some((attempt, outcome.clone()));
    }
}

struct Runtime {
    client: CertificateClient,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder wiring an [`EntitlementManager`] to its collaborators.
///
/// Anything not supplied is derived from the configuration: a file store at
/// `store.path`, an HTTP license server at `license.server_url`, and an
/// in-process bus.
pub struct ManagerBuilder {
    config: AppConfig,
    roles: Option<Arc<InstanceRoleResolver>>,
    store: Option<Arc<dyn EntitlementStore>>,
    server: Option<Arc<dyn LicenseServer>>,
    bus: Option<Arc<dyn CommandBus>>,
    usage: Option<Arc<dyn UsageMetricsSource>>,
    catalog: Option<FeatureCatalog>,
    verifier: Option<CertificateVerifier>,
    registry: Option<Registry>,
}

impl ManagerBuilder {
    pub fn with_roles(mut self, roles: Arc<InstanceRoleResolver>) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn EntitlementStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_server(mut self, server: Arc<dyn LicenseServer>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn CommandBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_usage_metrics(mut self, usage: Arc<dyn UsageMetricsSource>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_catalog(mut self, catalog: FeatureCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_verifier(mut self, verifier: CertificateVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Count store upserts on `registry`.
    pub fn with_metrics_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Arc<EntitlementManager>> {
        self.config
            .validate()
            .map_err(|err| LicenseError::Config(format!("{err:#}")))?;
        let license = self.config.license.clone();
        let roles = self
            .roles
            .unwrap_or_else(|| Arc::new(InstanceRoleResolver::from_config(&self.config)));

        let verifier = match (self.verifier, license.public_key.as_deref()) {
            (Some(verifier), _) => verifier,
            (None, Some(encoded)) => CertificateVerifier::from_hex(encoded)?,
            (None, None) => CertificateVerifier::default(),
        };

        let mut store = self
            .store
            .unwrap_or_else(|| Arc::new(FileSettingsStore::new(self.config.store.path.clone())));
        if let Some(registry) = &self.registry {
            let metrics =
                StoreMetrics::new(registry).map_err(|err| LicenseError::Store(err.to_string()))?;
            store = Arc::new(InstrumentedStore::new(store, metrics));
        }

        let server: Arc<dyn LicenseServer> = match self.server {
            Some(server) => server,
            None => Arc::new(HttpLicenseServer::from_config(&license)?),
        };

        let bus: Arc<dyn CommandBus> = self.bus.unwrap_or_else(|| Arc::new(InMemoryBus::new()));
        let broadcaster =
            ReloadBroadcaster::new(bus, roles.instance_id().to_owned(), license.request_timeout);

        Ok(Arc::new(EntitlementManager {
            execution_mode: self.config.executions.mode,
            license,
            roles,
            store,
            server,
            usage: self.usage.unwrap_or_else(|| Arc::new(NoUsageMetrics)),
            catalog: Arc::new(self.catalog.unwrap_or_else(FeatureCatalog::standard)),
            verifier,
            broadcaster,
            snapshot: ArcSwap::from_pointee(EntitlementSnapshot::default()),
            runtime: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            remote_gate: tokio::sync::Mutex::new(()),
            reload_gate: tokio::sync::Mutex::new(()),
            write_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
            renewals: Coalesced::default(),
            reloads: Coalesced::default(),
        }))
    }
}

/// Process-wide owner of license state.
pub struct EntitlementManager {
    license: LicenseConfig,
    execution_mode: ExecutionMode,
    roles: Arc<InstanceRoleResolver>,
    store: Arc<dyn EntitlementStore>,
    server: Arc<dyn LicenseServer>,
    usage: Arc<dyn UsageMetricsSource>,
    catalog: Arc<FeatureCatalog>,
    verifier: CertificateVerifier,
    broadcaster: ReloadBroadcaster,
    snapshot: ArcSwap<EntitlementSnapshot>,
    runtime: Mutex<Option<Arc<Runtime>>>,
    shutting_down: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    /// Serialises activation and renewal, including their server calls.
    remote_gate: tokio::sync::Mutex<()>,
    /// Serialises reloads, including their store reads.
    reload_gate: tokio::sync::Mutex<()>,
    /// Held only to compare and swap the snapshot.
    write_gate: Mutex<()>,
    /// Incremented on every installed certificate.
    generation: AtomicU64,
    renewals: Coalesced,
    reloads: Coalesced,
}

impl std::fmt::Debug for EntitlementManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementManager")
            .field("instance_id", &self.roles.instance_id())
            .field("role", &self.roles.role())
            .field("store", &self.store.name())
            .field("server", &self.server.endpoint())
            .finish_non_exhaustive()
    }
}

impl EntitlementManager {
    pub fn builder(config: AppConfig) -> ManagerBuilder {
        ManagerBuilder {
            config,
            roles: None,
            store: None,
            server: None,
            bus: None,
            usage: None,
            catalog: None,
            verifier: None,
            registry: None,
        }
    }

    /// Load the stored certificate, wire role hooks, and start background tasks.
    ///
    /// Calling this again without `force_recreate`, or after [`shutdown`](Self::shutdown),
    /// logs a warning and does nothing.
    pub async fn initialize(self: &Arc<Self>, options: InitOptions) -> InitOutcome {
        let _lifecycle = self.lifecycle.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(instance = %self.roles.instance_id(), "license manager is shutting down; initialize ignored");
            return InitOutcome::ShuttingDown;
        }
        if self.runtime.lock().is_some() {
            if !options.force_recreate {
                warn!(instance = %self.roles.instance_id(), "license manager already initialized");
                return InitOutcome::AlreadyInitialized;
            }
            debug!("recreating license manager runtime");
            self.teardown();
        }

        let role = self.roles.role();
        let offline = !options.is_primary_process;
        let hooks: Arc<dyn CertificateHooks> = match (options.is_primary_process, role) {
            (true, InstanceRole::Single | InstanceRole::Leader) => Arc::new(LeaderHooks::new(
                Arc::clone(&self.store),
                self.license.cert_key.clone(),
                self.license.request_timeout,
                Arc::clone(&self.usage),
            )),
            (true, InstanceRole::Follower) | (false, _) => Arc::new(PassiveHooks),
        };
        let client = CertificateClient::new(
            Arc::clone(&self.store),
            Arc::clone(&self.server),
            self.verifier.clone(),
            Arc::clone(&self.catalog),
            hooks,
            ClientPolicy {
                cert_key: self.license.cert_key.clone(),
                tenant_id: self.license.tenant_id,
                timeout: self.license.request_timeout,
                offline,
            },
        );

        let role_renews = match role {
            InstanceRole::Single | InstanceRole::Leader => true,
            InstanceRole::Follower => false,
        };
        let eligible = !offline && (options.is_cli || role_renews);
        if eligible && !self.license.auto_renew_enabled {
            warn!(
                instance = %self.roles.instance_id(),
                "automatic license renewal is disabled; licensed features will lapse when the certificate expires"
            );
        }
        let should_renew = eligible && self.license.auto_renew_enabled;

        let (shutdown, _) = broadcast::channel(1);
        let runtime = Arc::new(Runtime {
            client,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });
        *self.runtime.lock() = Some(Arc::clone(&runtime));

        let trigger: Arc<dyn ReloadHandler> = Arc::new(ReloadTrigger(Arc::downgrade(self)));
        let listener = self
            .broadcaster
            .spawn_listener(trigger, runtime.shutdown.subscribe());
        runtime.tasks.lock().push(listener);

        match self.reload().await {
            Ok(outcome) => debug!(?outcome, "initial certificate load finished"),
            Err(err) => warn!(error = %err, "initial certificate load failed"),
        }

        if self.effective().certificate.is_none() && !offline && role_renews {
            if let Some(key) = self.license.activation_key.clone() {
                match self.activate(&key).await {
                    Ok(outcome) => info!(?outcome, "activated license with configured key"),
                    Err(err) => warn!(error = %err, "activation with configured key failed"),
                }
            }
        }

        if should_renew {
            let task = renewal::spawn(
                Arc::downgrade(self),
                RenewalPolicy {
                    offset: self.license.auto_renew_offset,
                    retry_interval: self.license.renewal_retry_interval,
                },
                runtime.shutdown.subscribe(),
            );
            runtime.tasks.lock().push(task);
        }

        log_license_event(
            self.event_context(),
            "license.init",
            &format!(
                "license manager initialized (offline={offline}, auto_renew={should_renew}, plan={})",
                self.plan_name()
            ),
            EventOutcome::Success,
        );
        InitOutcome::Initialized
    }

    /// Stop background tasks. Later calls to [`initialize`](Self::initialize) are ignored.
    /// Queries keep answering from the last snapshot.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("license manager shutdown already requested");
            return;
        }
        let _lifecycle = self.lifecycle.lock().await;
        if self.teardown() {
            log_license_event(
                self.event_context(),
                "license.shutdown",
                "license manager stopped",
                EventOutcome::Success,
            );
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.lock().is_some()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Exchange an activation key for a certificate. Errors reach the caller;
    /// on failure the current entitlements stay in effect.
    pub async fn activate(&self, activation_key: &str) -> Result<RefreshOutcome> {
        let runtime = self.runtime()?;
        let outcome = self.activate_with(&runtime, activation_key).await;
        match &outcome {
            Ok(result) => log_license_event(
                self.event_context(),
                "license.activate",
                &format!("activation finished: {result:?}"),
                EventOutcome::Success,
            ),
            Err(err) => log_license_event(
                self.event_context(),
                "license.activate",
                &err.to_string(),
                EventOutcome::Fault,
            ),
        }
        outcome
    }

    async fn activate_with(&self, runtime: &Runtime, activation_key: &str) -> Result<RefreshOutcome> {
        if runtime.client.is_offline() {
            return Err(LicenseError::OfflineMode("activation"));
        }
        let _remote = self.remote_gate.lock().await;
        let raw = runtime.client.activate(activation_key.trim()).await?;
        self.apply_remote(runtime, &raw).await
    }

    /// Renew the certificate now. Errors reach the caller; on failure the
    /// current entitlements stay in effect.
    pub async fn renew(&self) -> Result<RefreshOutcome> {
        let outcome = self.renew_coalesced().await;
        match &outcome {
            Ok(result) => log_license_event(
                self.event_context(),
                "license.renew",
                &format!("renewal finished: {result:?}"),
                EventOutcome::Success,
            ),
            Err(err) => log_license_event(
                self.event_context(),
                "license.renew",
                &err.to_string(),
                EventOutcome::Fault,
            ),
        }
        outcome
    }

    pub(crate) async fn renew_in_background(&self) -> Result<RefreshOutcome> {
        self.renew_coalesced().await
    }

    /// A renewal already in flight when the caller arrives is joined; its
    /// outcome answers every caller queued behind it.
    async fn renew_coalesced(&self) -> Result<RefreshOutcome> {
        let runtime = self.runtime()?;
        if runtime.client.is_offline() {
            return Err(LicenseError::OfflineMode("renewal"));
        }
        let floor = self.renewals.in_flight_floor();
        let _remote = self.remote_gate.lock().await;
        if let Some(outcome) = self.renewals.joined(floor) {
            debug!("renewal finished while waiting; reusing its outcome");
            return outcome;
        }
        let attempt = self.renewals.begin();
        let outcome = self.renew_locked(&runtime).await;
        self.renewals.finish(attempt, &outcome);
        outcome
    }

    async fn renew_locked(&self, runtime: &Runtime) -> Result<RefreshOutcome> {
        let Some(current) = self.effective().certificate.clone() else {
            record_renewal("failed");
            return Err(LicenseError::LicenseServer(
                "no certificate loaded; activate a license before renewing".to_owned(),
            ));
        };
        let raw = match runtime.client.fetch_from_server(&current).await {
            Ok(raw) => raw,
            Err(err) => {
                record_renewal("failed");
                return Err(err);
            }
        };
        let outcome = self.apply_remote(runtime, &raw).await;
        record_renewal(match &outcome {
            Ok(RefreshOutcome::Changed) => "renewed",
            Ok(_) => "unchanged",
            Err(_) => "failed",
        });
        outcome
    }

    /// Re-validate the stored certificate without contacting the license server.
    /// Unreadable or invalid certificates leave the current state in place.
    ///
    /// Only a reload that started after this call arrived can answer it, so a
    /// store write announced before the call is always observed.
    pub async fn reload(&self) -> Result<RefreshOutcome> {
        let runtime = self.runtime()?;
        let floor = self.reloads.fresh_floor();
        let _reload = self.reload_gate.lock().await;
        if let Some(outcome) = self.reloads.joined(floor) {
            debug!("reload started after this request finished; reusing its outcome");
            return outcome;
        }
        let attempt = self.reloads.begin();
        let outcome = Ok(self.reload_locked(&runtime).await);
        self.reloads.finish(attempt, &outcome);
        outcome
    }

    async fn reload_locked(&self, runtime: &Runtime) -> RefreshOutcome {
        let seen = self.generation.load(Ordering::SeqCst);
        let raw = match runtime.client.load().await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("no stored certificate");
                return RefreshOutcome::NoCertificate;
            }
            Err(err) => {
                warn!(error = %err, "failed to read stored certificate; keeping current entitlements");
                return RefreshOutcome::KeptPrevious;
            }
        };
        if self.is_current(&raw) {
            return RefreshOutcome::Unchanged;
        }
        match runtime.client.validate_and_derive(&raw) {
            Ok((certificate, entitlements)) => self.install(certificate, entitlements, Some(seen)),
            Err(err) => {
                warn!(error = %err, "stored certificate rejected; keeping last known good entitlements");
                RefreshOutcome::KeptPrevious
            }
        }
    }

    async fn apply_remote(&self, runtime: &Runtime, raw: &str) -> Result<RefreshOutcome> {
        let (certificate, entitlements) = runtime.client.validate_and_derive(raw)?;
        let raw = certificate.raw.clone();
        let outcome = self.install(certificate, entitlements, None);
        if outcome == RefreshOutcome::Changed {
            self.on_certificate_changed(runtime, &raw).await;
        }
        Ok(outcome)
    }

    fn is_current(&self, raw: &str) -> bool {
        self.snapshot
            .load()
            .certificate
            .as_ref()
            .is_some_and(|current| current.raw == raw.trim())
    }

    /// Swap in a verified certificate. The write lock covers only the
    /// comparison and the swap; no I/O happens while it is held.
    ///
    /// `read_at` is the swap generation observed before a store read. If
    /// another certificate was installed since, the stored copy may be older
    /// and is not applied.
    fn install(
        &self,
        certificate: VerifiedCertificate,
        entitlements: EntitlementSet,
        read_at: Option<u64>,
    ) -> RefreshOutcome {
        let _write = self.write_gate.lock();
        if self.is_current(&certificate.raw) {
            return RefreshOutcome::Unchanged;
        }
        if read_at.is_some_and(|seen| seen != self.generation.load(Ordering::SeqCst)) {
            debug!("certificate replaced while the store was read; keeping the newer one");
            return RefreshOutcome::KeptPrevious;
        }
        record_license_load(&certificate);
        let multi_main = entitlements.flag(features::MULTIPLE_MAIN_INSTANCES);
        self.snapshot.store(Arc::new(EntitlementSnapshot {
            certificate: Some(certificate),
            entitlements,
        }));
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.assert_multi_main_licensed(multi_main);
        RefreshOutcome::Changed
    }

    /// Runs after a certificate fetched by this process is in effect. Stored
    /// certificates never get here, so receivers do not relay reloads.
    async fn on_certificate_changed(&self, runtime: &Runtime, raw: &str) {
        match self.roles.role() {
            InstanceRole::Follower => {
                debug!(
                    instance = %self.roles.instance_id(),
                    "follower instance; certificate neither persisted nor broadcast"
                );
                return;
            }
            InstanceRole::Single | InstanceRole::Leader => {}
        }

        if let Err(err) = runtime.client.persist(raw).await {
            warn!(error = %err, "failed to persist certificate; other instances keep the previous one");
            return;
        }

        match self.execution_mode {
            ExecutionMode::Queue => match self.broadcaster.publish().await {
                Ok(()) => record_reload_broadcast(),
                Err(err) => warn!(error = %err, "reload-license broadcast failed"),
            },
            ExecutionMode::Regular => debug!("regular execution mode; reload broadcast skipped"),
        }
    }

    /// Withdraw (or restore) multi-main support depending on whether the
    /// certificate covers it. Never fails and never stops running instances.
    fn assert_multi_main_licensed(&self, licensed: bool) {
        if !self.roles.is_multi_main_mode() {
            return;
        }
        if licensed {
            self.roles.restore_multi_main();
        } else if self.roles.withdraw_multi_main() {
            warn!(
                instance = %self.roles.instance_id(),
                "multi-main is configured but the license does not cover it"
            );
        }
    }

    /// Snapshot with expiry applied: once the certificate in effect expires,
    /// it is dropped and every entitlement lapses to the empty state.
    fn effective(&self) -> Arc<EntitlementSnapshot> {
        let current = self.snapshot.load_full();
        match current.certificate.as_ref() {
            Some(certificate) if certificate.expires_at <= Utc::now() => self.lapse(current),
            _ => current,
        }
    }

    fn lapse(&self, expired: Arc<EntitlementSnapshot>) -> Arc<EntitlementSnapshot> {
        let empty = Arc::new(EntitlementSnapshot::default());
        let previous = self.snapshot.compare_and_swap(&expired, Arc::clone(&empty));
        if !Arc::ptr_eq(&*previous, &expired) {
            // replaced concurrently; answer from whatever is in effect now
            return self.snapshot.load_full();
        }
        record_invalid_license("expired");
        warn!(
            instance = %self.roles.instance_id(),
            expired_at = ?expired.certificate.as_ref().map(|c| c.expires_at),
            "license certificate expired; licensed features are disabled"
        );
        empty
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime.lock().clone().ok_or(LicenseError::NotInitialized)
    }

    /// Returns `true` when a runtime was stopped.
    fn teardown(&self) -> bool {
        let Some(runtime) = self.runtime.lock().take() else {
            return false;
        };
        let _ = runtime.shutdown.send(());
        for task in runtime.tasks.lock().drain(..) {
            task.abort();
        }
        true
    }

    fn event_context(&self) -> EventContext<'_> {
        EventContext {
            instance: self.roles.instance_id(),
            role: self.roles.role().as_str(),
        }
    }

    /// Current snapshot; all reads from it are mutually consistent.
    pub fn snapshot(&self) -> Arc<EntitlementSnapshot> {
        self.effective()
    }

    /// Whether a feature is enabled. Unknown features are disabled.
    pub fn query_feature(&self, name: &str) -> bool {
        self.effective().entitlements.flag(name)
    }

    /// Limit of a quota. Unknown quotas are zero.
    pub fn query_quota(&self, name: &str) -> QuotaLimit {
        self.effective().entitlements.quota(name)
    }

    pub fn current_expiry(&self) -> Option<DateTime<Utc>> {
        self.effective()
            .certificate
            .as_ref()
            .map(|certificate| certificate.expires_at)
    }

    pub fn plan_name(&self) -> String {
        self.effective()
            .certificate
            .as_ref()
            .map_or_else(|| COMMUNITY_PLAN.to_owned(), |c| c.payload.plan.clone())
    }

    pub fn consumer_id(&self) -> String {
        self.effective()
            .certificate
            .as_ref()
            .map_or_else(|| UNKNOWN_CONSUMER.to_owned(), |c| c.payload.consumer_id.clone())
    }

    pub fn main_plan(&self) -> Option<MainPlan> {
        self.effective().certificate.as_ref().map(|c| MainPlan {
            product_id: c.payload.plan.clone(),
            valid_from: c.issued_at,
            valid_to: c.expires_at,
        })
    }

    /// Plans granted by the certificate in effect. Empty without one.
    pub fn available_plans(&self) -> Vec<String> {
        self.effective()
            .certificate
            .iter()
            .map(|c| c.payload.plan.clone())
            .collect()
    }

    pub fn management_jwt(&self) -> Option<String> {
        self.effective()
            .certificate
            .as_ref()
            .and_then(|c| c.payload.management_jwt.clone())
    }

    pub fn users_limit(&self) -> QuotaLimit {
        self.query_quota(quotas::USERS)
    }

    pub fn is_within_users_limit(&self, current_users: u64) -> bool {
        self.users_limit().is_within(current_users)
    }

    pub fn trigger_limit(&self) -> QuotaLimit {
        self.query_quota(quotas::TRIGGERS)
    }

    pub fn variables_limit(&self) -> QuotaLimit {
        self.query_quota(quotas::VARIABLES)
    }

    pub fn team_projects_limit(&self) -> QuotaLimit {
        self.query_quota(quotas::TEAM_PROJECTS)
    }

    pub fn ai_credits(&self) -> QuotaLimit {
        self.query_quota(quotas::AI_CREDITS)
    }

    pub fn api_keys_per_user_limit(&self) -> QuotaLimit {
        self.query_quota(quotas::API_KEYS_PER_USER)
    }

    pub fn workflow_history_prune_limit(&self) -> QuotaLimit {
        self.query_quota(quotas::WORKFLOW_HISTORY_PRUNE)
    }

    pub fn is_sharing_enabled(&self) -> bool {
        self.query_feature(features::SHARING)
    }

    pub fn is_ldap_enabled(&self) -> bool {
        self.query_feature(features::LDAP)
    }

    pub fn is_saml_enabled(&self) -> bool {
        self.query_feature(features::SAML)
    }

    pub fn is_log_streaming_enabled(&self) -> bool {
        self.query_feature(features::LOG_STREAMING)
    }

    pub fn is_advanced_execution_filters_enabled(&self) -> bool {
        self.query_feature(features::ADVANCED_EXECUTION_FILTERS)
    }

    pub fn is_variables_enabled(&self) -> bool {
        self.query_feature(features::VARIABLES)
    }

    pub fn is_source_control_licensed(&self) -> bool {
        self.query_feature(features::SOURCE_CONTROL)
    }

    pub fn is_external_secrets_enabled(&self) -> bool {
        self.query_feature(features::EXTERNAL_SECRETS)
    }

    pub fn is_debug_in_editor_licensed(&self) -> bool {
        self.query_feature(features::DEBUG_IN_EDITOR)
    }

    pub fn is_binary_data_s3_licensed(&self) -> bool {
        self.query_feature(features::BINARY_DATA_S3)
    }

    pub fn is_multi_main_licensed(&self) -> bool {
        self.query_feature(features::MULTIPLE_MAIN_INSTANCES)
    }

    pub fn is_worker_view_licensed(&self) -> bool {
        self.query_feature(features::WORKER_VIEW)
    }

    pub fn is_advanced_permissions_licensed(&self) -> bool {
        self.query_feature(features::ADVANCED_PERMISSIONS)
    }

    pub fn is_workflow_history_licensed(&self) -> bool {
        self.query_feature(features::WORKFLOW_HISTORY)
    }

    pub fn is_ai_assistant_enabled(&self) -> bool {
        self.query_feature(features::AI_ASSISTANT)
    }

    pub fn is_ask_ai_enabled(&self) -> bool {
        self.query_feature(features::ASK_AI)
    }

    pub fn is_ai_credits_enabled(&self) -> bool {
        self.query_feature(features::AI_CREDITS)
    }

    pub fn is_api_disabled(&self) -> bool {
        self.query_feature(features::API_DISABLED)
    }

    pub fn is_custom_npm_registry_enabled(&self) -> bool {
        self.query_feature(features::CUSTOM_NPM_REGISTRY)
    }

    pub fn is_project_role_admin_licensed(&self) -> bool {
        self.query_feature(features::PROJECT_ROLE_ADMIN)
    }

    pub fn is_project_role_editor_licensed(&self) -> bool {
        self.query_feature(features::PROJECT_ROLE_EDITOR)
    }

    pub fn is_project_role_viewer_licensed(&self) -> bool {
        self.query_feature(features::PROJECT_ROLE_VIEWER)
    }

    pub fn info(&self) -> LicenseInfo {
        let snapshot = self.effective();
        let certificate = snapshot.certificate.as_ref();
        LicenseInfo {
            plan_name: certificate
                .map_or_else(|| COMMUNITY_PLAN.to_owned(), |c| c.payload.plan.clone()),
            consumer_id: certificate
                .map_or_else(|| UNKNOWN_CONSUMER.to_owned(), |c| c.payload.consumer_id.clone()),
            issued_at: certificate.map(|c| c.issued_at),
            expires_at: certificate.map(|c| c.expires_at),
            instance_id: self.roles.instance_id().to_owned(),
            role: self.roles.role(),
            multi_main_withdrawn: self.roles.is_multi_main_withdrawn(),
            features: snapshot.entitlements.flags(),
            quotas: snapshot.entitlements.quotas(),
        }
    }

    pub fn catalog(&self) -> &FeatureCatalog {
        &self.catalog
    }

    pub fn role(&self) -> InstanceRole {
        self.roles.role()
    }

    pub fn roles(&self) -> &InstanceRoleResolver {
        &self.roles
    }

    pub fn broadcast_metrics(&self) -> BroadcastMetrics {
        self.broadcaster.metrics()
    }
}

impl Drop for EntitlementManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Bus handler that reloads the manager, if it still exists.
struct ReloadTrigger(Weak<EntitlementManager>);

#[async_trait]
impl ReloadHandler for ReloadTrigger {
    async fn on_reload(&self) {
        let Some(manager) = self.0.upgrade() else {
            return;
        };
        match manager.reload().await {
            Ok(outcome) => debug!(?outcome, "reload-license handled"),
            Err(err) => warn!(error = %err, "reload-license ignored"),
        }
    }
}
