//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Shared primitives and utilities for the core runtime."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_server_url() -> String {
    "https://license.entitle.invalid/v1".to_owned()
}

fn default_auto_renew_enabled() -> bool {
    true
}

fn default_auto_renew_offset() -> Duration {
    Duration::from_secs(72 * 60 * 60)
}

fn default_renewal_retry_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_tenant_id() -> u32 {
    1
}

fn default_cert_key() -> String {
    "license-cert".to_owned()
}

fn default_instance_id() -> String {
    "main".to_owned()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("target/entitle/settings.json")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for an Entitle instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub license: LicenseConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub multi_main: MultiMainConfig,
    #[serde(default)]
    pub executions: ExecutionsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "ENTITLE_CONFIG";

    /// Load configuration from disk, respecting the `ENTITLE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ENTITLE_LICENSE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply license overrides from an arbitrary lookup, used by tests and embedders.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty("ENTITLE_LICENSE_SERVER_URL") {
            self.license.server_url = url.trim().to_owned();
        }
        if let Some(key) = non_empty("ENTITLE_LICENSE_ACTIVATION_KEY") {
            self.license.activation_key = Some(key.trim().to_owned());
        }
        if let Some(flag) = non_empty("ENTITLE_LICENSE_AUTO_RENEW_ENABLED") {
            self.license.auto_renew_enabled = parse_bool(&flag).ok_or_else(|| {
                anyhow!("ENTITLE_LICENSE_AUTO_RENEW_ENABLED must be a boolean, got '{flag}'")
            })?;
        }
        if let Some(tenant) = non_empty("ENTITLE_LICENSE_TENANT_ID") {
            self.license.tenant_id = tenant
                .trim()
                .parse()
                .with_context(|| format!("ENTITLE_LICENSE_TENANT_ID must be numeric, got '{tenant}'"))?;
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.license.validate()?;
        if self.instance.id.trim().is_empty() {
            return Err(anyhow!("instance.id cannot be empty"));
        }
        Ok(())
    }

    /// Whether this process is the primary (main) process of its deployment.
    pub fn is_primary_process(&self) -> bool {
        matches!(self.instance.process, ProcessKind::Main)
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// License server and renewal policy settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_auto_renew_enabled")]
    pub auto_renew_enabled: bool,
    #[serde(default = "default_auto_renew_offset")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub auto_renew_offset: Duration,
    #[serde(default = "default_renewal_retry_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub renewal_retry_interval: Duration,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub activation_key: Option<String>,
    #[serde(default = "default_tenant_id")]
    pub tenant_id: u32,
    /// Hex encoded Ed25519 verifying key. The embedded key is used when unset.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default = "default_cert_key")]
    pub cert_key: String,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            auto_renew_enabled: default_auto_renew_enabled(),
            auto_renew_offset: default_auto_renew_offset(),
            renewal_retry_interval: default_renewal_retry_interval(),
            request_timeout: default_request_timeout(),
            activation_key: None,
            tenant_id: default_tenant_id(),
            public_key: None,
            cert_key: default_cert_key(),
        }
    }
}

impl LicenseConfig {
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.server_url)
            .with_context(|| format!("license.server_url '{}' is not a valid url", self.server_url))?;
        if self.auto_renew_enabled && self.auto_renew_offset.is_zero() {
            return Err(anyhow!(
                "license.auto_renew_offset must be non-zero when auto renew is enabled"
            ));
        }
        if self.renewal_retry_interval.is_zero() {
            return Err(anyhow!("license.renewal_retry_interval must be non-zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("license.request_timeout must be non-zero"));
        }
        if self.cert_key.trim().is_empty() {
            return Err(anyhow!("license.cert_key cannot be empty"));
        }
        Ok(())
    }
}

/// Kind of process this instance runs as.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    #[default]
    Main,
    Worker,
    Webhook,
}

/// Role requested for this instance when multi-main is enabled.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfiguredRole {
    #[default]
    Leader,
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_instance_id")]
    pub id: String,
    #[serde(default)]
    pub process: ProcessKind,
    #[serde(default)]
    pub role: ConfiguredRole,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            id: default_instance_id(),
            process: ProcessKind::default(),
            role: ConfiguredRole::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiMainConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Execution mode of the surrounding application.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Regular,
    Queue,
}

impl ExecutionMode {
    pub fn is_queue(&self) -> bool {
        matches!(self, ExecutionMode::Queue)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionsConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}
