//! ---
//! ent_section: "14-licensing-system"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Licensing enforcement and entitlement checks."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
//! Signed certificate envelope and Ed25519 verification.
//!
//! A certificate is `base64(json({version, payload, signature}))` where the
//! signature covers the canonical JSON encoding of `payload`.
use std::collections::BTreeMap;
use std::convert::TryInto;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{LicenseError, Result};
use crate::logging::record_invalid_license;

/// Embedded public key for validating certificates issued by the production license server.
pub const DEV_PUBLIC_KEY: [u8; 32] = [
    168, 0, 169, 32, 60, 42, 128, 57, 90, 246, 86, 71, 142, 136, 197, 255, 102, 76, 29, 121, 51,
    29, 142, 59, 79, 67, 201, 133, 11, 56, 13, 229,
];

/// Envelope version written by [`encode_certificate`].
pub const CERTIFICATE_VERSION: u32 = 1;

/// Raw entitlement value carried in a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntitlementValue {
    /// Feature flag.
    Flag(bool),
    /// Numeric quota; negative values mean unlimited.
    Quota(i64),
}

/// Signed content of a license certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificatePayload {
    /// Consumer identifier assigned by the license server.
    pub consumer_id: String,
    /// Product identifier of the main plan.
    pub plan: String,
    /// RFC 3339 issuance timestamp.
    pub issued_at: String,
    /// RFC 3339 expiry timestamp.
    pub expires_at: String,
    /// Granted feature flags and quotas keyed by catalog name.
    #[serde(default)]
    pub entitlements: BTreeMap<String, EntitlementValue>,
    /// Token used by the application to call the license server management API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_jwt: Option<String>,
}

impl CertificatePayload {
    /// Build a payload issued now and valid for `validity`.
    #[must_use]
    pub fn new(consumer_id: impl Into<String>, plan: impl Into<String>, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            consumer_id: consumer_id.into(),
            plan: plan.into(),
            issued_at: now.to_rfc3339(),
            expires_at: (now + validity).to_rfc3339(),
            entitlements: BTreeMap::new(),
            management_jwt: None,
        }
    }

    /// Grant (or explicitly deny) a feature flag.
    #[must_use]
    pub fn with_flag(mut self, key: impl Into<String>, enabled: bool) -> Self {
        self.entitlements
            .insert(key.into(), EntitlementValue::Flag(enabled));
        self
    }

    /// Grant a quota; pass a negative value for unlimited.
    #[must_use]
    pub fn with_quota(mut self, key: impl Into<String>, limit: i64) -> Self {
        self.entitlements
            .insert(key.into(), EntitlementValue::Quota(limit));
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CertificateEnvelope {
    version: u32,
    payload: CertificatePayload,
    signature: String,
}

impl CertificateEnvelope {
    fn decode(raw: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|err| invalid("malformed", format!("certificate must be base64 encoded: {err}")))?;
        serde_json::from_slice(&bytes).map_err(|err| {
            invalid(
                "malformed",
                format!("certificate must decode into a JSON envelope: {err}"),
            )
        })
    }
}

/// Certificate that passed signature and expiry checks.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedCertificate {
    /// Original encoded blob, as stored and transmitted.
    pub raw: String,
    /// Decoded signed payload.
    pub payload: CertificatePayload,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl VerifiedCertificate {
    /// Moment at which renewal should be attempted for the given offset.
    #[must_use]
    pub fn renew_at(&self, offset: std::time::Duration) -> DateTime<Utc> {
        let offset = Duration::from_std(offset).unwrap_or_else(|_| Duration::zero());
        self.expires_at - offset
    }
}

/// Verifies certificates against a single Ed25519 public key.
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    public_key: [u8; 32],
}

impl Default for CertificateVerifier {
    fn default() -> Self {
        Self {
            public_key: DEV_PUBLIC_KEY,
        }
    }
}

impl CertificateVerifier {
    /// Verifier using the embedded public key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the public key used for verification.
    #[must_use]
    pub fn with_public_key(public_key: [u8; 32]) -> Self {
        Self { public_key }
    }

    /// Parse a hex encoded public key, as found in configuration.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|err| LicenseError::InvalidCertificate(format!("public key must be hex: {err}")))?;
        let public_key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            LicenseError::InvalidCertificate(format!(
                "public key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { public_key })
    }

    /// Decode and verify a certificate, rejecting it if already expired.
    pub fn verify(&self, raw: &str) -> Result<VerifiedCertificate> {
        self.verify_at(raw, Utc::now())
    }

    /// Decode and verify a certificate against an explicit clock.
    pub fn verify_at(&self, raw: &str, now: DateTime<Utc>) -> Result<VerifiedCertificate> {
        let envelope = CertificateEnvelope::decode(raw)?;
        if envelope.version != CERTIFICATE_VERSION {
            return Err(invalid(
                "malformed",
                format!("unsupported certificate version {}", envelope.version),
            ));
        }

        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|err| invalid("invalid_key", format!("invalid public key material: {err}")))?;
        let signature_bytes = general_purpose::STANDARD
            .decode(envelope.signature.trim())
            .map_err(|_| invalid("invalid_signature", "signature must be base64 encoded"))?;
        let signature_array: [u8; 64] = signature_bytes
            .as_slice()
            .try_into()
            .map_err(|_| invalid("invalid_signature", "invalid signature length"))?;
        let signature = Signature::from_bytes(&signature_array);
        let signed = serde_json::to_vec(&envelope.payload)
            .map_err(|err| invalid("malformed", format!("failed to serialise payload: {err}")))?;
        key.verify_strict(&signed, &signature)
            .map_err(|err| invalid("invalid_signature", format!("signature verification failed: {err}")))?;

        let payload = envelope.payload;
        let issued_at = parse_timestamp("issued_at", &payload.issued_at)?;
        let expires_at = parse_timestamp("expires_at", &payload.expires_at)?;
        if expires_at <= now {
            return Err(invalid(
                "expired",
                format!("certificate for '{}' expired at {expires_at}", payload.consumer_id),
            ));
        }

        Ok(VerifiedCertificate {
            raw: raw.trim().to_owned(),
            payload,
            issued_at,
            expires_at,
        })
    }
}

/// Sign and encode a certificate payload.
pub fn encode_certificate(signing_key: &SigningKey, payload: &CertificatePayload) -> Result<String> {
    let signed = serde_json::to_vec(payload)
        .map_err(|err| LicenseError::InvalidCertificate(format!("failed to serialise payload: {err}")))?;
    let signature = signing_key.sign(&signed);
    let envelope = CertificateEnvelope {
        version: CERTIFICATE_VERSION,
        payload: payload.clone(),
        signature: general_purpose::STANDARD.encode(signature.to_bytes()),
    };
    let json = serde_json::to_vec(&envelope)
        .map_err(|err| LicenseError::InvalidCertificate(format!("failed to serialise envelope: {err}")))?;
    Ok(general_purpose::STANDARD.encode(json))
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|err| invalid("malformed", format!("invalid {field} timestamp: {err}")))
}

fn invalid(reason: &'static str, message: impl Into<String>) -> LicenseError {
    record_invalid_license(reason);
    LicenseError::InvalidCertificate(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SigningKey, [u8; 32]) {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let public = signing_key.verifying_key().to_bytes();
        (signing_key, public)
    }

    fn payload() -> CertificatePayload {
        CertificatePayload::new("consumer-1", "enterprise", Duration::days(30))
            .with_flag("feat:sharing", true)
            .with_quota("quota:users", -1)
    }

    #[test]
    fn issued_certificate_verifies() {
        let (signing_key, public) = keypair();
        let raw = encode_certificate(&signing_key, &payload()).expect("encode");
        let verified = CertificateVerifier::with_public_key(public)
            .verify(&raw)
            .expect("valid certificate");
        assert_eq!(verified.payload.consumer_id, "consumer-1");
        assert_eq!(
            verified.payload.entitlements.get("quota:users"),
            Some(&EntitlementValue::Quota(-1))
        );
        assert!(verified.renew_at(std::time::Duration::from_secs(3600)) < verified.expires_at);
    }

    #[test]
    fn tampered_certificate_is_rejected() {
        let (signing_key, public) = keypair();
        let raw = encode_certificate(&signing_key, &payload()).expect("encode");
        let mut envelope: serde_json::Value =
            serde_json::from_slice(&general_purpose::STANDARD.decode(&raw).unwrap()).unwrap();
        envelope["payload"]["entitlements"]["feat:ldap"] = serde_json::json!(true);
        let tampered = general_purpose::STANDARD.encode(serde_json::to_vec(&envelope).unwrap());

        let err = CertificateVerifier::with_public_key(public)
            .verify(&tampered)
            .expect_err("tampered payload must fail");
        assert!(matches!(err, LicenseError::InvalidCertificate(_)));
    }

    #[test]
    fn foreign_key_is_rejected() {
        let (signing_key, _) = keypair();
        let raw = encode_certificate(&signing_key, &payload()).expect("encode");
        let other = SigningKey::from_bytes(&[9u8; 32]).verifying_key().to_bytes();
        assert!(CertificateVerifier::with_public_key(other).verify(&raw).is_err());
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let (signing_key, public) = keypair();
        let raw = encode_certificate(&signing_key, &payload()).expect("encode");
        let later = Utc::now() + Duration::days(31);
        let err = CertificateVerifier::with_public_key(public)
            .verify_at(&raw, later)
            .expect_err("expired");
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn garbage_is_rejected_without_panicking() {
        let verifier = CertificateVerifier::new();
        assert!(verifier.verify("").is_err());
        assert!(verifier.verify("not base64 !!").is_err());
        assert!(verifier
            .verify(&general_purpose::STANDARD.encode(b"{\"version\":1}"))
            .is_err());
    }

    #[test]
    fn hex_public_key_parses() {
        let (_, public) = keypair();
        assert!(CertificateVerifier::from_hex(&hex::encode(public)).is_ok());
        assert!(CertificateVerifier::from_hex("abcd").is_err());
    }
}
