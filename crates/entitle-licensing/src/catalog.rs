//! ---
//! ent_section: "14-licensing-system"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Licensing enforcement and entitlement checks."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Feature flag keys known to the application.
pub mod features {
    pub const SHARING: &str = "feat:sharing";
    pub const LDAP: &str = "feat:ldap";
    pub const SAML: &str = "feat:saml";
    pub const LOG_STREAMING: &str = "feat:logStreaming";
    pub const ADVANCED_EXECUTION_FILTERS: &str = "feat:advancedExecutionFilters";
    pub const VARIABLES: &str = "feat:variables";
    pub const SOURCE_CONTROL: &str = "feat:sourceControl";
    pub const EXTERNAL_SECRETS: &str = "feat:externalSecrets";
    pub const DEBUG_IN_EDITOR: &str = "feat:debugInEditor";
    pub const BINARY_DATA_S3: &str = "feat:binaryDataS3";
    pub const MULTIPLE_MAIN_INSTANCES: &str = "feat:multipleMainInstances";
    pub const WORKER_VIEW: &str = "feat:workerView";
    pub const ADVANCED_PERMISSIONS: &str = "feat:advancedPermissions";
    pub const WORKFLOW_HISTORY: &str = "feat:workflowHistory";
    pub const AI_ASSISTANT: &str = "feat:aiAssistant";
    pub const ASK_AI: &str = "feat:askAi";
    pub const AI_CREDITS: &str = "feat:aiCredits";
    pub const API_DISABLED: &str = "feat:apiDisabled";
    pub const CUSTOM_NPM_REGISTRY: &str = "feat:communityNodes:customRegistry";
    pub const PROJECT_ROLE_ADMIN: &str = "feat:projectRole:admin";
    pub const PROJECT_ROLE_EDITOR: &str = "feat:projectRole:editor";
    pub const PROJECT_ROLE_VIEWER: &str = "feat:projectRole:viewer";
}

/// Quota keys known to the application.
pub mod quotas {
    pub const USERS: &str = "quota:users";
    pub const TRIGGERS: &str = "quota:activeWorkflows";
    pub const VARIABLES: &str = "quota:maxVariables";
    pub const TEAM_PROJECTS: &str = "quota:maxTeamProjects";
    pub const AI_CREDITS: &str = "quota:aiCredits";
    pub const WORKFLOW_HISTORY_PRUNE: &str = "quota:workflowHistoryPrune";
    pub const API_KEYS_PER_USER: &str = "quota:apiKeysPerUser";
}

/// What a quota resolves to when a loaded certificate does not mention it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaFallback {
    /// Missing quota means no limit.
    Unlimited,
    /// Missing quota means zero.
    Closed,
}

/// Type tag of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EntitlementKind {
    /// Boolean feature flag.
    Flag,
    /// Numeric quota with its per-key fallback.
    Quota { fallback: QuotaFallback },
}

/// Static description of every entitlement the application consults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureCatalog {
    entries: IndexMap<String, EntitlementKind>,
}

impl FeatureCatalog {
    /// An empty catalog; every lookup resolves to disabled/zero.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The catalog shipped with the application.
    #[must_use]
    pub fn standard() -> Self {
        let flags = [
            features::SHARING,
            features::LDAP,
            features::SAML,
            features::LOG_STREAMING,
            features::ADVANCED_EXECUTION_FILTERS,
            features::VARIABLES,
            features::SOURCE_CONTROL,
            features::EXTERNAL_SECRETS,
            features::DEBUG_IN_EDITOR,
            features::BINARY_DATA_S3,
            features::MULTIPLE_MAIN_INSTANCES,
            features::WORKER_VIEW,
            features::ADVANCED_PERMISSIONS,
            features::WORKFLOW_HISTORY,
            features::AI_ASSISTANT,
            features::ASK_AI,
            features::AI_CREDITS,
            features::API_DISABLED,
            features::CUSTOM_NPM_REGISTRY,
            features::PROJECT_ROLE_ADMIN,
            features::PROJECT_ROLE_EDITOR,
            features::PROJECT_ROLE_VIEWER,
        ];
        let mut catalog = flags
            .into_iter()
            .fold(Self::empty(), |catalog, key| catalog.with_flag(key));

        // Community limits are unrestricted; paid-only capacity stays closed.
        catalog = catalog
            .with_quota(quotas::USERS, QuotaFallback::Unlimited)
            .with_quota(quotas::TRIGGERS, QuotaFallback::Unlimited)
            .with_quota(quotas::VARIABLES, QuotaFallback::Unlimited)
            .with_quota(quotas::WORKFLOW_HISTORY_PRUNE, QuotaFallback::Unlimited)
            .with_quota(quotas::TEAM_PROJECTS, QuotaFallback::Closed)
            .with_quota(quotas::AI_CREDITS, QuotaFallback::Closed)
            .with_quota(quotas::API_KEYS_PER_USER, QuotaFallback::Closed);
        catalog
    }

    /// Register a feature flag.
    #[must_use]
    pub fn with_flag(mut self, key: impl Into<String>) -> Self {
        self.entries.insert(key.into(), EntitlementKind::Flag);
        self
    }

    /// Register a quota with its fallback policy.
    #[must_use]
    pub fn with_quota(mut self, key: impl Into<String>, fallback: QuotaFallback) -> Self {
        self.entries
            .insert(key.into(), EntitlementKind::Quota { fallback });
        self
    }

    /// Type tag of a key, if the key is known.
    #[must_use]
    pub fn kind(&self, key: &str) -> Option<EntitlementKind> {
        self.entries.get(key).copied()
    }

    /// Iterate over entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, EntitlementKind)> {
        self.entries.iter().map(|(key, kind)| (key.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
