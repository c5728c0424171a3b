//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the hub runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the hub workspace: configuration loading, tracing setup and
//! clock helpers.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AdapterConfig, HubConfig, LoadedHubConfig, LoggingConfig, ManagerConfig, MetricsConfig,
    NodeConfig, PersistenceConfig, SubscriptionConfig,
};
pub use logging::{init_tracing, LogFormat};
