//! ---
//! ent_section: "07-resilience-fault-tolerance"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Instance role resolution and follower admission."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
//! Role of this process within a deployment of cooperating instances.

mod resolver;

pub use resolver::{InstanceRole, InstanceRoleResolver};
