//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Entitlement manager and license server integration."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use entitle_common::config::LicenseConfig;
use entitle_licensing::{LicenseError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One usage sample reported to the license server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetric {
    pub metric: String,
    pub value: i64,
}

impl UsageMetric {
    pub fn new(metric: impl Into<String>, value: i64) -> Self {
        Self {
            metric: metric.into(),
            value,
        }
    }
}

/// Body of an activation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationRequest {
    pub tenant_id: u32,
    pub activation_key: String,
    pub usage_metrics: Vec<UsageMetric>,
    pub passthrough: serde_json::Value,
}

/// Body of a renewal request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenewalRequest {
    pub tenant_id: u32,
    pub consumer_id: String,
    pub certificate: String,
    pub usage_metrics: Vec<UsageMetric>,
    pub passthrough: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CertificateResponse {
    certificate: String,
}

/// Remote issuer of license certificates.
#[async_trait]
pub trait LicenseServer: Send + Sync {
    /// Exchange an activation key for a certificate.
    async fn activate(&self, request: &ActivationRequest) -> Result<String>;
    /// Exchange the current certificate for a fresh one.
    async fn renew(&self, request: &RenewalRequest) -> Result<String>;
    /// Endpoint description for logs.
    fn endpoint(&self) -> &str;
}

/// [`LicenseServer`] speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpLicenseServer {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLicenseServer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LicenseError::LicenseServer(format!("failed to build http client: {err}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
        })
    }

    pub fn from_config(config: &LicenseConfig) -> Result<Self> {
        Self::new(config.server_url.clone(), config.request_timeout)
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<String> {
        let url = format!("{}/{path}", self.base_url);
        debug!(%url, "calling license server");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| LicenseError::LicenseServer(format!("request to {url} failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LicenseError::LicenseServer(format!(
                "{url} answered {status}: {}",
                detail.trim()
            )));
        }

        let payload: CertificateResponse = response.json().await.map_err(|err| {
            LicenseError::LicenseServer(format!("unexpected response from {url}: {err}"))
        })?;
        Ok(payload.certificate)
    }
}

#[async_trait]
impl LicenseServer for HttpLicenseServer {
    async fn activate(&self, request: &ActivationRequest) -> Result<String> {
        self.post("activate", request).await
    }

    async fn renew(&self, request: &RenewalRequest) -> Result<String> {
        self.post("renew", request).await
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }
}
