//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Node, group and fleet metrics for the hub, with a Prometheus scrape endpoint.

pub mod export;
pub mod server;
pub mod store;

/// Shared result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics for node {0} already exist")]
    DuplicateNode(String),
    #[error("metric {name} already registered for node {node}")]
    DuplicateMetric { node: String, name: String },
    #[error("no metrics registered for node {0}")]
    UnknownNode(String),
    #[error("metric {name} not registered for node {node}")]
    UnknownMetric { node: String, name: String },
    #[error("unknown metrics category {0}")]
    UnknownCategory(String),
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics encoding error: {0}")]
    Encoding(String),
}

pub use export::{gather, render_text, MetricsCategory};
pub use server::{
    new_registry, spawn_http_server, DaemonMetrics, ExportState, MetricsServer, SharedRegistry,
};
pub use store::{FleetCounts, MetricEntry, MetricKind, MetricsStore, NodeMetricSet, StoreView};

pub use prometheus;
