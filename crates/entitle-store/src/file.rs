//! ---
//! ent_section: "03-persistence-logging"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Persistence abstractions and storage bindings."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{EntitlementStore, Result, StoreError, UpsertOptions};

/// Current settings file envelope version.
pub const SETTINGS_VERSION: u16 = 1;

/// A single persisted setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingRecord {
    /// Stored value.
    pub value: String,
    /// Whether the application loads this setting eagerly.
    #[serde(default)]
    pub load_on_startup: bool,
    /// Timestamp of the last write.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsEnvelope {
    version: u16,
    hash: String,
    settings: BTreeMap<String, SettingRecord>,
}

/// Settings store backed by a single JSON file with an integrity hash.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// original, so readers never observe a partially written file.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSettingsStore {
    /// Create a store rooted at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_envelope(&self) -> Result<SettingsEnvelope> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(SettingsEnvelope {
                    version: SETTINGS_VERSION,
                    ..SettingsEnvelope::default()
                })
            }
            Err(err) => return Err(err.into()),
        };
        let envelope: SettingsEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.hash != compute_hash(&envelope.settings)? {
            return Err(StoreError::HashMismatch);
        }
        Ok(envelope)
    }

    async fn write_envelope(&self, envelope: &mut SettingsEnvelope) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        envelope.version = SETTINGS_VERSION;
        envelope.hash = compute_hash(&envelope.settings)?;
        let json = serde_json::to_vec_pretty(envelope)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for FileSettingsStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let envelope = self.read_envelope().await?;
        Ok(envelope.settings.get(key).map(|record| record.value.clone()))
    }

    async fn upsert(&self, key: &str, value: &str, options: UpsertOptions) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut envelope = self.read_envelope().await?;
        if let Some(existing) = envelope.settings.get(key) {
            if existing.value == value && existing.load_on_startup == options.load_on_startup {
                debug!(key, path = %self.path.display(), "setting unchanged; skipping write");
                return Ok(());
            }
        }
        envelope.settings.insert(
            key.to_owned(),
            SettingRecord {
                value: value.to_owned(),
                load_on_startup: options.load_on_startup,
                updated_at: Utc::now(),
            },
        );
        self.write_envelope(&mut envelope).await?;
        debug!(key, path = %self.path.display(), "setting persisted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

fn compute_hash(settings: &BTreeMap<String, SettingRecord>) -> Result<String> {
    let serialized = serde_json::to_vec(settings)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
