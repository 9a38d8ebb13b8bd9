//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "tests"
//! ent_type: "test"
//! ent_scope: "code"
//! ent_description: "Entitlement manager behaviour against in-memory collaborators."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use entitle_bus::InMemoryBus;
use entitle_common::config::{AppConfig, ConfiguredRole, ExecutionMode};
use entitle_core::{
    EntitlementManager, InitOptions, InitOutcome, RefreshOutcome,
};
use entitle_licensing::catalog::{features, quotas};
use entitle_licensing::{CertificatePayload, LicenseError, QuotaLimit};
use entitle_store::InMemorySettingsStore;
use entitle_testkit::{instance_config, issue, verifier, CountingBus, FakeLicenseServer, FixedUsage};

const PRIMARY: InitOptions = InitOptions {
    force_recreate: false,
    is_primary_process: true,
    is_cli: false,
};

struct Fixture {
    manager: Arc<EntitlementManager>,
    store: InMemorySettingsStore,
    server: Arc<FakeLicenseServer>,
    bus: Arc<CountingBus>,
}

fn fixture_with(config: AppConfig, store: InMemorySettingsStore, server: Arc<FakeLicenseServer>) -> Fixture {
    let bus = Arc::new(CountingBus::attach(&InMemoryBus::new()));
    let manager = EntitlementManager::builder(config)
        .with_store(Arc::new(store.clone()))
        .with_server(server.clone())
        .with_bus(bus.clone())
        .with_verifier(verifier())
        .build()
        .expect("manager builds");
    Fixture {
        manager,
        store,
        server,
        bus,
    }
}

fn single(mode: ExecutionMode) -> AppConfig {
    instance_config("main", false, ConfiguredRole::Leader, mode)
}

fn stored_certificate(store: &InMemorySettingsStore, sharing: bool) -> String {
    let raw = issue(
        &CertificatePayload::new("consumer-1", "enterprise", chrono::Duration::days(30))
            .with_flag(features::SHARING, sharing)
            .with_quota(quotas::USERS, 10),
    );
    store.seed("license-cert", raw.clone());
    raw
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn fresh_boot_starts_closed_then_activation_grants_sharing() {
    let server = Arc::new(FakeLicenseServer::default());
    server.grant_flag(features::SHARING, true);
    let fx = fixture_with(single(ExecutionMode::Regular), InMemorySettingsStore::new(), server);

    assert_eq!(fx.manager.initialize(PRIMARY).await, InitOutcome::Initialized);
    assert!(!fx.manager.query_feature(features::SHARING));
    assert_eq!(fx.manager.query_quota(quotas::USERS), QuotaLimit::Limited(0));

    let outcome = fx.manager.activate("key-123").await.expect("activation succeeds");
    assert_eq!(outcome, RefreshOutcome::Changed);
    assert!(fx.manager.query_feature(features::SHARING));
    assert!(fx.manager.is_sharing_enabled());
    // a loaded certificate that omits the users quota falls back to unlimited
    assert_eq!(fx.manager.users_limit(), QuotaLimit::Unlimited);
    assert_eq!(fx.manager.team_projects_limit(), QuotaLimit::Limited(0));
    assert_eq!(fx.store.upsert_count(), 1);
    assert_eq!(
        fx.server.last_activation().expect("activation sent").activation_key,
        "key-123"
    );
}

#[tokio::test]
async fn configured_activation_key_is_used_on_boot() {
    let server = Arc::new(FakeLicenseServer::default());
    server.grant_flag(features::SHARING, true);
    let mut config = single(ExecutionMode::Regular);
    config.license.activation_key = Some("boot-key".into());
    let fx = fixture_with(config, InMemorySettingsStore::new(), server);

    fx.manager.initialize(PRIMARY).await;

    assert_eq!(fx.server.activation_calls(), 1);
    assert!(fx.manager.query_feature(features::SHARING));
    assert_eq!(fx.manager.plan_name(), "enterprise");
}

#[tokio::test]
async fn failed_boot_activation_does_not_abort_initialize() {
    let server = Arc::new(FakeLicenseServer::default());
    server.set_failing(true);
    let mut config = single(ExecutionMode::Regular);
    config.license.activation_key = Some("boot-key".into());
    let fx = fixture_with(config, InMemorySettingsStore::new(), server);

    assert_eq!(fx.manager.initialize(PRIMARY).await, InitOutcome::Initialized);
    assert!(fx.manager.is_initialized());
    assert_eq!(fx.manager.plan_name(), "Community");
}

#[tokio::test]
async fn stored_certificate_is_loaded_on_initialize() {
    let store = InMemorySettingsStore::new();
    stored_certificate(&store, true);
    let fx = fixture_with(
        single(ExecutionMode::Regular),
        store,
        Arc::new(FakeLicenseServer::default()),
    );

    fx.manager.initialize(PRIMARY).await;

    assert!(fx.manager.query_feature(features::SHARING));
    assert_eq!(fx.manager.users_limit(), QuotaLimit::Limited(10));
    assert!(fx.manager.is_within_users_limit(9));
    assert!(!fx.manager.is_within_users_limit(10));
    assert_eq!(fx.manager.consumer_id(), "consumer-1");
    // loading a stored certificate never writes it back
    assert_eq!(fx.store.upsert_count(), 0);
    assert_eq!(fx.server.activation_calls() + fx.server.renewal_calls(), 0);
}

#[tokio::test]
async fn invalid_stored_certificate_keeps_last_known_good() {
    let store = InMemorySettingsStore::new();
    stored_certificate(&store, true);
    let fx = fixture_with(
        single(ExecutionMode::Regular),
        store,
        Arc::new(FakeLicenseServer::default()),
    );
    fx.manager.initialize(PRIMARY).await;
    let before = fx.manager.info();

    fx.store.seed("license-cert", "definitely-not-a-certificate");
    let outcome = fx.manager.reload().await.expect("reload never fails once initialized");

    assert_eq!(outcome, RefreshOutcome::KeptPrevious);
    assert!(fx.manager.query_feature(features::SHARING));
    assert_eq!(fx.manager.info().features, before.features);
    assert_eq!(fx.manager.info().expires_at, before.expires_at);
}

#[tokio::test]
async fn failed_renewal_surfaces_error_and_keeps_state() {
    let store = InMemorySettingsStore::new();
    stored_certificate(&store, true);
    let server = Arc::new(FakeLicenseServer::default());
    let fx = fixture_with(single(ExecutionMode::Regular), store, server);
    fx.manager.initialize(PRIMARY).await;

    fx.server.set_failing(true);
    let err = fx.manager.renew().await.expect_err("server is down");

    assert!(matches!(err, LicenseError::LicenseServer(_)));
    assert!(fx.manager.query_feature(features::SHARING));
    assert_eq!(fx.store.upsert_count(), 0);
}

#[tokio::test]
async fn renewal_reports_usage_and_current_certificate() {
    let store = InMemorySettingsStore::new();
    let raw = stored_certificate(&store, true);
    let server = Arc::new(FakeLicenseServer::default());
    let usage = Arc::new(FixedUsage::new(4));
    let manager = EntitlementManager::builder(single(ExecutionMode::Regular))
        .with_store(Arc::new(store.clone()))
        .with_server(server.clone())
        .with_usage_metrics(usage.clone())
        .with_verifier(verifier())
        .build()
        .expect("manager builds");
    manager.initialize(PRIMARY).await;

    assert_eq!(manager.renew().await, Ok(RefreshOutcome::Changed));

    let request = server.last_renewal().expect("renewal sent");
    assert_eq!(request.certificate, raw);
    assert_eq!(request.consumer_id, "consumer-1");
    assert_eq!(request.usage_metrics[0].metric, "users");
    assert_eq!(request.usage_metrics[0].value, 4);
    assert_eq!(request.passthrough["source"], "testkit");
    assert_eq!(usage.calls(), 1);
    assert_eq!(store.upsert_count(), 1);
}

#[tokio::test]
async fn renew_without_certificate_fails() {
    let fx = fixture_with(
        single(ExecutionMode::Regular),
        InMemorySettingsStore::new(),
        Arc::new(FakeLicenseServer::default()),
    );
    fx.manager.initialize(PRIMARY).await;
    assert!(matches!(
        fx.manager.renew().await,
        Err(LicenseError::LicenseServer(_))
    ));
    assert_eq!(fx.server.renewal_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_renewals_share_one_server_call() {
    let store = InMemorySettingsStore::new();
    stored_certificate(&store, true);
    let server = Arc::new(FakeLicenseServer::default());
    server.set_delay(Duration::from_millis(200));
    let fx = fixture_with(single(ExecutionMode::Regular), store, server);
    fx.manager.initialize(PRIMARY).await;

    let first = {
        let manager = Arc::clone(&fx.manager);
        tokio::spawn(async move { manager.renew().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let manager = Arc::clone(&fx.manager);
        tokio::spawn(async move { manager.renew().await })
    };

    let first = first.await.expect("join");
    let second = second.await.expect("join");
    assert_eq!(first, Ok(RefreshOutcome::Changed));
    assert_eq!(second, first);
    assert_eq!(fx.server.renewal_calls(), 1);
    assert_eq!(fx.store.upsert_count(), 1);
}

#[tokio::test]
async fn shutdown_then_initialize_is_a_no_op() {
    let store = InMemorySettingsStore::new();
    stored_certificate(&store, true);
    let fx = fixture_with(
        single(ExecutionMode::Regular),
        store,
        Arc::new(FakeLicenseServer::default()),
    );
    fx.manager.initialize(PRIMARY).await;
    let loads = fx.store.load_count();

    fx.manager.shutdown().await;
    let outcome = fx.manager.initialize(PRIMARY).await;

    assert_eq!(outcome, InitOutcome::ShuttingDown);
    assert_eq!(fx.store.load_count(), loads);
    assert_eq!(fx.server.activation_calls() + fx.server.renewal_calls(), 0);
    assert!(fx.manager.is_shutting_down());
    assert!(!fx.manager.is_initialized());
    // queries keep answering from the last snapshot
    assert!(fx.manager.query_feature(features::SHARING));
    assert_eq!(fx.manager.renew().await, Err(LicenseError::NotInitialized));
}

#[tokio::test]
async fn second_initialize_needs_force_recreate() {
    let store = InMemorySettingsStore::new();
    stored_certificate(&store, false);
    let fx = fixture_with(
        single(ExecutionMode::Regular),
        store,
        Arc::new(FakeLicenseServer::default()),
    );
    fx.manager.initialize(PRIMARY).await;
    let loads = fx.store.load_count();

    assert_eq!(
        fx.manager.initialize(PRIMARY).await,
        InitOutcome::AlreadyInitialized
    );
    assert_eq!(fx.store.load_count(), loads);

    stored_certificate(&fx.store, true);
    let recreate = InitOptions {
        force_recreate: true,
        ..PRIMARY
    };
    assert_eq!(fx.manager.initialize(recreate).await, InitOutcome::Initialized);
    assert!(fx.manager.query_feature(features::SHARING));
}

#[tokio::test]
async fn non_primary_process_is_offline() {
    let store = InMemorySettingsStore::new();
    stored_certificate(&store, true);
    let fx = fixture_with(
        single(ExecutionMode::Queue),
        store,
        Arc::new(FakeLicenseServer::default()),
    );
    let worker = InitOptions {
        is_primary_process: false,
        ..PRIMARY
    };
    fx.manager.initialize(worker).await;

    assert!(fx.manager.query_feature(features::SHARING));
    assert_eq!(
        fx.manager.activate("key").await,
        Err(LicenseError::OfflineMode("activation"))
    );
    assert_eq!(
        fx.manager.renew().await,
        Err(LicenseError::OfflineMode("renewal"))
    );
    assert_eq!(fx.server.activation_calls() + fx.server.renewal_calls(), 0);
    assert_eq!(fx.store.upsert_count(), 0);
    assert_eq!(fx.bus.published(), 0);
}

#[tokio::test]
async fn broadcast_only_happens_in_queue_mode() {
    let regular = fixture_with(
        single(ExecutionMode::Regular),
        InMemorySettingsStore::new(),
        Arc::new(FakeLicenseServer::default()),
    );
    regular.manager.initialize(PRIMARY).await;
    regular.manager.activate("key").await.expect("activation");
    assert_eq!(regular.bus.published(), 0);
    assert_eq!(regular.store.upsert_count(), 1);

    let queue = fixture_with(
        single(ExecutionMode::Queue),
        InMemorySettingsStore::new(),
        Arc::new(FakeLicenseServer::default()),
    );
    queue.manager.initialize(PRIMARY).await;
    queue.manager.activate("key").await.expect("activation");
    assert_eq!(queue.bus.published(), 1);
    assert_eq!(queue.manager.broadcast_metrics().sent, 1);
}

#[tokio::test]
async fn reload_does_not_rebroadcast() {
    let fx = fixture_with(
        single(ExecutionMode::Queue),
        InMemorySettingsStore::new(),
        Arc::new(FakeLicenseServer::default()),
    );
    fx.manager.initialize(PRIMARY).await;

    stored_certificate(&fx.store, true);
    assert_eq!(fx.manager.reload().await, Ok(RefreshOutcome::Changed));
    assert_eq!(fx.manager.reload().await, Ok(RefreshOutcome::Unchanged));

    assert_eq!(fx.bus.published(), 0);
    assert_eq!(fx.store.upsert_count(), 0);
}

#[tokio::test]
async fn missing_multi_main_entitlement_withdraws_support_without_failing() {
    let server = Arc::new(FakeLicenseServer::default());
    server.grant_flag(features::SHARING, true);
    let config = instance_config("leader", true, ConfiguredRole::Leader, ExecutionMode::Queue);
    let fx = fixture_with(config, InMemorySettingsStore::new(), server);
    fx.manager.initialize(PRIMARY).await;

    fx.manager.activate("key").await.expect("activation");
    assert!(fx.manager.roles().is_multi_main_withdrawn());
    assert!(!fx.manager.roles().admit_follower());
    assert!(fx.manager.query_feature(features::SHARING));
    assert!(fx.manager.info().multi_main_withdrawn);

    fx.server.grant_flag(features::MULTIPLE_MAIN_INSTANCES, true);
    fx.manager.renew().await.expect("renewal");
    assert!(!fx.manager.roles().is_multi_main_withdrawn());
    assert!(fx.manager.roles().admit_follower());
    assert!(fx.manager.is_multi_main_licensed());
}

#[tokio::test]
async fn overdue_certificate_is_renewed_by_the_scheduler() {
    let store = InMemorySettingsStore::new();
    store.seed(
        "license-cert",
        issue(&CertificatePayload::new(
            "consumer-1",
            "enterprise",
            chrono::Duration::hours(1),
        )),
    );
    let server = Arc::new(FakeLicenseServer::default());
    server.set_validity(chrono::Duration::hours(1));
    let mut config = single(ExecutionMode::Regular);
    config.license.auto_renew_offset = Duration::from_secs(2 * 60 * 60);
    let fx = fixture_with(config, store, server);

    fx.manager.initialize(PRIMARY).await;
    let server = Arc::clone(&fx.server);
    wait_until(move || server.renewal_calls() >= 1).await;

    // the renewed certificate is still inside the offset; the next try waits
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.server.renewal_calls(), 1);
    fx.manager.shutdown().await;
}

#[tokio::test]
async fn disabled_auto_renew_never_schedules() {
    let store = InMemorySettingsStore::new();
    store.seed(
        "license-cert",
        issue(&CertificatePayload::new(
            "consumer-1",
            "enterprise",
            chrono::Duration::hours(1),
        )),
    );
    let mut config = single(ExecutionMode::Regular);
    config.license.auto_renew_enabled = false;
    let fx = fixture_with(config, store, Arc::new(FakeLicenseServer::default()));

    fx.manager.initialize(PRIMARY).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(fx.server.renewal_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_a_mixed_snapshot() {
    let both_on = issue(
        &CertificatePayload::new("consumer-1", "enterprise", chrono::Duration::days(1))
            .with_flag(features::SHARING, true)
            .with_flag(features::LDAP, true),
    );
    let both_off = issue(
        &CertificatePayload::new("consumer-1", "enterprise", chrono::Duration::days(1))
            .with_flag(features::SHARING, false)
            .with_flag(features::LDAP, false),
    );
    let store = InMemorySettingsStore::new();
    store.seed("license-cert", both_on.clone());
    let fx = fixture_with(
        single(ExecutionMode::Regular),
        store,
        Arc::new(FakeLicenseServer::default()),
    );
    fx.manager.initialize(PRIMARY).await;

    let mut readers = Vec::new();
    for _ in 0..3 {
        let manager = Arc::clone(&fx.manager);
        readers.push(tokio::spawn(async move {
            for _ in 0..2_000 {
                let snapshot = manager.snapshot();
                assert_eq!(snapshot.flag(features::SHARING), snapshot.flag(features::LDAP));
                tokio::task::yield_now().await;
            }
        }));
    }

    for round in 0..50 {
        let next = if round % 2 == 0 { &both_off } else { &both_on };
        fx.store.seed("license-cert", next.clone());
        fx.manager.reload().await.expect("reload");
    }

    for reader in readers {
        reader.await.expect("reader saw a consistent snapshot");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_renewal_does_not_hold_up_reloads_or_queries() {
    let store = InMemorySettingsStore::new();
    stored_certificate(&store, true);
    let fx = fixture_with(
        single(ExecutionMode::Regular),
        store,
        Arc::new(FakeLicenseServer::default()),
    );
    fx.manager.initialize(PRIMARY).await;
    fx.server.set_delay(Duration::from_millis(1_000));

    let renewal = {
        let manager = Arc::clone(&fx.manager);
        tokio::spawn(async move { manager.renew().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    assert_eq!(fx.manager.reload().await, Ok(RefreshOutcome::Unchanged));
    assert!(fx.manager.is_sharing_enabled());
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "reload waited {:?} behind the server call",
        started.elapsed()
    );

    assert_eq!(renewal.await.expect("join"), Ok(RefreshOutcome::Changed));
    assert_eq!(fx.server.renewal_calls(), 1);
}

#[tokio::test]
async fn expired_certificate_lapses_while_running() {
    let store = InMemorySettingsStore::new();
    store.seed(
        "license-cert",
        issue(
            &CertificatePayload::new("consumer-1", "enterprise", chrono::Duration::seconds(1))
                .with_flag(features::SHARING, true),
        ),
    );
    let mut config = single(ExecutionMode::Regular);
    config.license.auto_renew_enabled = false;
    let fx = fixture_with(config, store, Arc::new(FakeLicenseServer::default()));
    fx.manager.initialize(PRIMARY).await;
    assert!(fx.manager.is_sharing_enabled());
    assert_eq!(fx.manager.plan_name(), "enterprise");

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    assert!(!fx.manager.is_sharing_enabled());
    assert_eq!(fx.manager.plan_name(), "Community");
    assert!(fx.manager.snapshot().certificate().is_none());
    assert!(fx.manager.current_expiry().is_none());

    // a restart would reject the same stored certificate
    assert_eq!(fx.manager.reload().await, Ok(RefreshOutcome::KeptPrevious));
    assert!(!fx.manager.is_sharing_enabled());
    assert!(matches!(
        fx.manager.renew().await,
        Err(LicenseError::LicenseServer(_))
    ));
    assert_eq!(fx.server.renewal_calls(), 0);
}

#[tokio::test]
async fn named_helpers_follow_the_catalog() {
    let server = Arc::new(FakeLicenseServer::default());
    server.set_plan("business");
    server
        .grant_flag(features::LOG_STREAMING, true)
        .grant_flag(features::WORKER_VIEW, true)
        .grant_flag(features::ASK_AI, true)
        .grant_flag(features::PROJECT_ROLE_ADMIN, true)
        .grant_quota(quotas::API_KEYS_PER_USER, 5);
    let fx = fixture_with(single(ExecutionMode::Regular), InMemorySettingsStore::new(), server);
    fx.manager.initialize(PRIMARY).await;
    assert!(fx.manager.available_plans().is_empty());
    assert_eq!(fx.manager.workflow_history_prune_limit(), QuotaLimit::Limited(0));

    fx.manager.activate("key").await.expect("activation");

    assert_eq!(fx.manager.available_plans(), vec!["business".to_owned()]);
    assert!(fx.manager.is_log_streaming_enabled());
    assert!(fx.manager.is_worker_view_licensed());
    assert!(fx.manager.is_ask_ai_enabled());
    assert!(fx.manager.is_project_role_admin_licensed());
    assert!(!fx.manager.is_project_role_viewer_licensed());
    assert!(!fx.manager.is_external_secrets_enabled());
    assert_eq!(fx.manager.api_keys_per_user_limit(), QuotaLimit::Limited(5));
    // omitted fail-open quota
    assert_eq!(fx.manager.workflow_history_prune_limit(), QuotaLimit::Unlimited);
}
