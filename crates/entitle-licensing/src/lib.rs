//! ---
//! ent_section: "14-licensing-system"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Licensing enforcement and entitlement checks."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
//! Entitle licensing crate: certificate format and verification, the feature
//! catalog, derivation of entitlement sets, and license telemetry.

pub mod catalog;
pub mod certificates;
pub mod entitlements;
pub mod error;
pub mod logging;

pub use catalog::{EntitlementKind, FeatureCatalog, QuotaFallback};
pub use certificates::{
    encode_certificate, CertificatePayload, CertificateVerifier, EntitlementValue,
    VerifiedCertificate,
};
pub use entitlements::{EntitlementSet, QuotaLimit, UNLIMITED_QUOTA};
pub use error::{LicenseError, Result};
