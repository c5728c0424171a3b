//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Node registry, subscriptions and the manager task."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Node registry and the manager task that owns it.

pub mod manager;
pub mod registry;
pub mod subscriptions;

pub use manager::{Manager, ManagerClient, ManagerError, ManagerHandle, ManagerOptions, NodeSummary};
pub use registry::{NodeRegistry, RegistryEntry, RegistryError, RuntimeHandle};
pub use subscriptions::Subscriptions;
