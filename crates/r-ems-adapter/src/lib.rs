//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Adapter runtime, lifecycle and plugin capability contract."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Adapter runtime hosting one protocol plugin per node.

pub mod callbacks;
pub mod driver;
pub mod lifecycle;
pub mod metrics;
pub mod plugin;
pub mod runtime;

pub use callbacks::{AdapterCallbacks, NodeStatus};
pub use driver::{DriverState, MAX_GROUPS};
pub use lifecycle::{check_ctl, on_setting_accepted};
pub use plugin::{
    DriverPlugin, Plugin, PluginCatalog, PluginError, PluginModule, PluginResult, PollContext,
};
pub use runtime::{Adapter, AdapterError, AdapterHandle, AdapterOptions};
