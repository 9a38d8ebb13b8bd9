//! ---
//! ent_section: "14-licensing-system"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Licensing enforcement and entitlement checks."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, warn};

use crate::catalog::{EntitlementKind, FeatureCatalog, QuotaFallback};
use crate::certificates::{CertificatePayload, EntitlementValue};

/// Wire value used for an unlimited quota.
pub const UNLIMITED_QUOTA: i64 = -1;

/// Resolved numeric limit of a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "i64")]
pub enum QuotaLimit {
    Limited(u64),
    Unlimited,
}

impl QuotaLimit {
    /// Interpret a raw certificate value; negative values mean unlimited.
    #[must_use]
    pub fn from_raw(raw: i64) -> Self {
        u64::try_from(raw).map_or(QuotaLimit::Unlimited, QuotaLimit::Limited)
    }

    /// Numeric representation, with [`UNLIMITED_QUOTA`] for no limit.
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        match self {
            QuotaLimit::Limited(limit) => i64::try_from(*limit).unwrap_or(i64::MAX),
            QuotaLimit::Unlimited => UNLIMITED_QUOTA,
        }
    }

    /// Whether `current` usage is still below the limit.
    #[must_use]
    pub fn is_within(&self, current: u64) -> bool {
        match self {
            QuotaLimit::Limited(limit) => current < *limit,
            QuotaLimit::Unlimited => true,
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        matches!(self, QuotaLimit::Unlimited)
    }
}

impl From<QuotaLimit> for i64 {
    fn from(limit: QuotaLimit) -> Self {
        limit.as_i64()
    }
}

/// Feature flags and quotas derived from a certificate and the catalog.
///
/// A set is never patched in place: every certificate load derives a fresh one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitlementSet {
    flags: HashMap<String, bool>,
    quotas: HashMap<String, QuotaLimit>,
}

impl EntitlementSet {
    /// Set used before any certificate was loaded: every flag off, every quota zero.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derive the set for `payload`. Keys outside the catalog are ignored.
    #[must_use]
    pub fn derive(payload: &CertificatePayload, catalog: &FeatureCatalog) -> Self {
        let mut flags = HashMap::new();
        let mut quotas = HashMap::new();

        for (key, kind) in catalog.iter() {
            let granted = payload.entitlements.get(key).copied();
            match (kind, granted) {
                (EntitlementKind::Flag, Some(EntitlementValue::Flag(enabled))) => {
                    flags.insert(key.to_owned(), enabled);
                }
                (EntitlementKind::Flag, Some(EntitlementValue::Quota(value))) => {
                    warn!(key, value, "certificate carries a quota for a feature flag; treating as disabled");
                    flags.insert(key.to_owned(), false);
                }
                (EntitlementKind::Flag, None) => {
                    flags.insert(key.to_owned(), false);
                }
                (EntitlementKind::Quota { .. }, Some(EntitlementValue::Quota(value))) => {
                    quotas.insert(key.to_owned(), QuotaLimit::from_raw(value));
                }
                (EntitlementKind::Quota { fallback }, granted) => {
                    if let Some(EntitlementValue::Flag(value)) = granted {
                        warn!(key, value, "certificate carries a flag for a quota; applying fallback");
                    }
                    let limit = match fallback {
                        QuotaFallback::Unlimited => QuotaLimit::Unlimited,
                        QuotaFallback::Closed => QuotaLimit::Limited(0),
                    };
                    quotas.insert(key.to_owned(), limit);
                }
            }
        }

        for key in payload.entitlements.keys() {
            if catalog.kind(key).is_none() {
                debug!(key = %key, "ignoring entitlement missing from catalog");
            }
        }

        Self { flags, quotas }
    }

    /// Whether a feature is enabled. Unknown names are disabled.
    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    /// Limit of a quota. Unknown names resolve to zero.
    #[must_use]
    pub fn quota(&self, name: &str) -> QuotaLimit {
        self.quotas
            .get(name)
            .copied()
            .unwrap_or(QuotaLimit::Limited(0))
    }

    /// Sorted view of every flag, for reporting.
    #[must_use]
    pub fn flags(&self) -> BTreeMap<String, bool> {
        self.flags
            .iter()
            .map(|(key, enabled)| (key.clone(), *enabled))
            .collect()
    }

    /// Sorted view of every quota, for reporting.
    #[must_use]
    pub fn quotas(&self) -> BTreeMap<String, QuotaLimit> {
        self.quotas
            .iter()
            .map(|(key, limit)| (key.clone(), *limit))
            .collect()
    }
}
