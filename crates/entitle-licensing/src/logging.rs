//! ---
//! ent_section: "14-licensing-system"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Licensing enforcement and entitlement checks."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use tracing::info;

use crate::certificates::VerifiedCertificate;

static LICENSE_LOADS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "license_loads_total",
        "Total number of certificates that validated and were applied"
    )
    .expect("metric registration to succeed")
});

static LICENSE_INVALID_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "license_invalid_total",
        "Total number of rejected certificates by reason",
        &["reason"]
    )
    .expect("metric registration to succeed")
});

static LICENSE_RENEWALS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "license_renewals_total",
        "Total number of renewal attempts by outcome",
        &["outcome"]
    )
    .expect("metric registration to succeed")
});

static LICENSE_RELOAD_BROADCASTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "license_reload_broadcasts_total",
        "Total number of reload-license commands published"
    )
    .expect("metric registration to succeed")
});

/// Record an applied certificate.
pub fn record_license_load(certificate: &VerifiedCertificate) {
    LICENSE_LOADS_TOTAL.inc();
    info!(
        consumer_id = %certificate.payload.consumer_id,
        plan = %certificate.payload.plan,
        expires_at = %certificate.expires_at,
        "license accepted"
    );
}

/// Record a rejected certificate.
pub fn record_invalid_license(reason: &str) {
    LICENSE_INVALID_TOTAL.with_label_values(&[reason]).inc();
    info!(reason = reason, "license rejected");
}

/// Record the outcome of a renewal attempt (`renewed`, `unchanged`, `failed`).
pub fn record_renewal(outcome: &str) {
    LICENSE_RENEWALS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a published reload command.
pub fn record_reload_broadcast() {
    LICENSE_RELOAD_BROADCASTS_TOTAL.inc();
}
