//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Entitlement manager and license server integration."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
//! Entitlement manager, certificate client, and renewal scheduling for Entitle.

pub mod client;
pub mod hooks;
pub mod manager;
pub mod renewal;
pub mod server;

pub use client::{CertificateClient, ClientPolicy};
pub use hooks::{CertificateHooks, LeaderHooks, NoUsageMetrics, PassiveHooks, UsageMetricsSource};
pub use manager::{
    EntitlementManager, EntitlementSnapshot, InitOptions, InitOutcome, LicenseInfo, MainPlan,
    ManagerBuilder, RefreshOutcome,
};
pub use renewal::{renewal_delay, RenewalPolicy};
pub use server::{
    ActivationRequest, HttpLicenseServer, LicenseServer, RenewalRequest, UsageMetric,
};
