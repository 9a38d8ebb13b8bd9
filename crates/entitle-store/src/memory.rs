//! ---
//! ent_section: "03-persistence-logging"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Persistence abstractions and storage bindings."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{EntitlementStore, Result, UpsertOptions};

#[derive(Debug, Default)]
struct Shared {
    values: RwLock<HashMap<String, (String, UpsertOptions)>>,
    loads: AtomicUsize,
    upserts: AtomicUsize,
}

/// In-process store. Clones share the same backing map, which lets several
/// simulated instances point at one "database".
#[derive(Debug, Clone, Default)]
pub struct InMemorySettingsStore {
    shared: Arc<Shared>,
}

impl InMemorySettingsStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without counting it as an upsert.
    pub fn seed(&self, key: impl Into<String>, value: impl Into<String>) {
        self.shared
            .values
            .write()
            .insert(key.into(), (value.into(), UpsertOptions::default()));
    }

    /// Number of upsert calls observed across all clones.
    pub fn upsert_count(&self) -> usize {
        self.shared.upserts.load(Ordering::SeqCst)
    }

    /// Number of load calls observed across all clones.
    pub fn load_count(&self) -> usize {
        self.shared.loads.load(Ordering::SeqCst)
    }

    /// Options recorded with the last upsert of `key`.
    pub fn options_for(&self, key: &str) -> Option<UpsertOptions> {
        self.shared.values.read().get(key).map(|(_, options)| *options)
    }
}

#[async_trait]
impl EntitlementStore for InMemorySettingsStore {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        self.shared.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .shared
            .values
            .read()
            .get(key)
            .map(|(value, _)| value.clone()))
    }

    async fn upsert(&self, key: &str, value: &str, options: UpsertOptions) -> Result<()> {
        self.shared.upserts.fetch_add(1, Ordering::SeqCst);
        self.shared
            .values
            .write()
            .insert(key.to_owned(), (value.to_owned(), options));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
