//! ---
//! ent_section: "14-licensing-system"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Licensing enforcement and entitlement checks."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use thiserror::Error;

/// Result alias used throughout the licensing crates.
pub type Result<T> = std::result::Result<T, LicenseError>;

/// Errors raised while acquiring, validating, or distributing a license certificate.
///
/// The type is `Clone` so that callers which coalesce onto an in-flight refresh
/// can observe the exact failure of that refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LicenseError {
    /// Signature, encoding, or expiry check failed.
    #[error("invalid license certificate: {0}")]
    InvalidCertificate(String),

    /// Remote license server unreachable, timed out, or answered with an error.
    #[error("license server error: {0}")]
    LicenseServer(String),

    /// The operation needs the license server but this process is offline-only.
    #[error("license client is offline; {0} requires a primary process")]
    OfflineMode(&'static str),

    /// The manager has not been initialized (or was shut down).
    #[error("license manager is not initialized")]
    NotInitialized,

    /// Persistence adapter failure.
    #[error("entitlement store error: {0}")]
    Store(String),

    /// Message bus failure.
    #[error("message bus error: {0}")]
    Bus(String),

    /// Configuration handed to the manager failed validation.
    #[error("invalid license configuration: {0}")]
    Config(String),
}

impl LicenseError {
    /// Short label used for metrics and structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            LicenseError::InvalidCertificate(_) => "invalid_certificate",
            LicenseError::LicenseServer(_) => "license_server",
            LicenseError::OfflineMode(_) => "offline",
            LicenseError::NotInitialized => "not_initialized",
            LicenseError::Store(_) => "store",
            LicenseError::Bus(_) => "bus",
            LicenseError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = LicenseError::OfflineMode("renew");
        assert_eq!(
            err.to_string(),
            "license client is offline; renew requires a primary process"
        );
        assert_eq!(err.kind(), "offline");
    }
}
