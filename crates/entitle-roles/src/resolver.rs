//! ---
//! ent_section: "07-resilience-fault-tolerance"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Instance role resolution and follower admission."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use entitle_common::config::{AppConfig, ConfiguredRole, ProcessKind};
use serde::Serialize;
use tracing::{info, warn};

/// Role of this process. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    /// The only main instance; multi-main is disabled.
    Single,
    /// The instance allowed to renew, persist and broadcast.
    Leader,
    /// Consumes state produced by the leader.
    Follower,
}

impl InstanceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceRole::Single => "single",
            InstanceRole::Leader => "leader",
            InstanceRole::Follower => "follower",
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of deployment identity, plus the multi-main support flag.
///
/// The role never changes after construction. The only mutable state is
/// whether the current license still covers multiple main instances.
#[derive(Debug)]
pub struct InstanceRoleResolver {
    instance_id: String,
    process: ProcessKind,
    role: InstanceRole,
    multi_main: bool,
    withdrawn: AtomicBool,
}

impl InstanceRoleResolver {
    pub fn new(
        instance_id: impl Into<String>,
        process: ProcessKind,
        multi_main: bool,
        configured: ConfiguredRole,
    ) -> Self {
        let role = match (multi_main, configured) {
            (false, _) => InstanceRole::Single,
            (true, ConfiguredRole::Leader) => InstanceRole::Leader,
            (true, ConfiguredRole::Follower) => InstanceRole::Follower,
        };
        Self {
            instance_id: instance_id.into(),
            process,
            role,
            multi_main,
            withdrawn: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.instance.id.clone(),
            config.instance.process,
            config.multi_main.enabled,
            config.instance.role,
        )
    }

    pub fn role(&self) -> InstanceRole {
        self.role
    }

    pub fn is_multi_main_mode(&self) -> bool {
        self.multi_main
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn process(&self) -> ProcessKind {
        self.process
    }

    /// Mark multi-main support as no longer covered by the license.
    /// Returns `true` when this call changed the flag.
    pub fn withdraw_multi_main(&self) -> bool {
        let changed = !self.withdrawn.swap(true, Ordering::SeqCst);
        if changed {
            warn!(
                instance = %self.instance_id,
                role = %self.role,
                "multi-main support withdrawn; new followers will be refused"
            );
        }
        changed
    }

    /// Clear a previous withdrawal. Returns `true` when this call changed the flag.
    pub fn restore_multi_main(&self) -> bool {
        let changed = self.withdrawn.swap(false, Ordering::SeqCst);
        if changed {
            info!(instance = %self.instance_id, role = %self.role, "multi-main support restored");
        }
        changed
    }

    pub fn is_multi_main_withdrawn(&self) -> bool {
        self.withdrawn.load(Ordering::SeqCst)
    }

    /// Whether a new follower may join. Existing followers are never evicted.
    pub fn admit_follower(&self) -> bool {
        self.multi_main && !self.is_multi_main_withdrawn()
    }
}
