//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Shared primitives and utilities for the core runtime."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
//! Shared primitives for the Entitle workspace: configuration loading and
//! tracing initialisation consumed by every other crate.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, ConfiguredRole, ExecutionMode, InstanceConfig, LicenseConfig, LoggingConfig,
    ProcessKind,
};
pub use logging::{init_cli_tracing, init_tracing, log_license_event, EventContext, EventOutcome, LogFormat};
